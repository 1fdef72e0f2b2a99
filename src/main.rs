use std::env;
use std::fs;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use structopt::StructOpt;

use hm10_ota::ble::{AtCommand, ConnectionStatus, Hm10};
use hm10_ota::ota::{FileStaging, Sender, SessionOutcome, Updater};
use hm10_ota::{Config, Error, MonotonicClock, SerialTransport};

mod cli;

type Module = Hm10<SerialTransport, MonotonicClock>;

/// Opens the serial port and makes sure the module is listening for AT commands
fn open_module(opts: &cli::Opts, config: Config) -> Result<Module, anyhow::Error> {
    println!("Using serial device {:?}", opts.serial_port);

    let transport = SerialTransport::open(&opts.serial_port, opts.baud_rate)?;
    let mut module = Hm10::new(transport, MonotonicClock::new(), config);

    module
        .enter_command_mode()
        .with_context(|| "The HM-10 did not answer AT")?;

    Ok(module)
}

fn print_info(module: &mut Module) -> Result<(), anyhow::Error> {
    println!("Name:          {}", module.get_name()?);
    println!("Address:       {}", module.get_address()?);
    println!("Role:          {:?}", module.get_role()?);
    println!("PIN code mode: {:?}", module.get_pin_code_mode()?);
    println!("Work mode:     {:?}", module.get_work_mode()?);
    println!("Work type:     {:?}", module.get_work_type()?);

    Ok(())
}

fn receive(module: Module, opts: &cli::ReceiveOpts, config: Config) -> Result<(), anyhow::Error> {
    let staging = FileStaging::new(&opts.dir, opts.capacity).with_context(|| {
        format!(
            "Failed to prepare staging directory '{}'",
            opts.dir.as_path().display()
        )
    })?;

    let mut updater = Updater::new(module, staging, config);

    loop {
        if !updater.ble().transport_ready() && !updater.engine().state().is_active() {
            println!("Waiting for a peer to connect");

            match updater.ble_mut().wait_for_connection(Duration::from_secs(60)) {
                Ok(_) => println!("Peer connected"),
                Err(Error::TransportTimeout) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        match updater.poll()? {
            Some(SessionOutcome::Committed { kind, size, crc }) => {
                println!(
                    "Committed {:?} image of {} bytes (crc {:#010x}) to {}",
                    kind,
                    size,
                    crc,
                    opts.dir.as_path().display()
                );

                if opts.once {
                    return Ok(());
                }
            }
            Some(SessionOutcome::Aborted(reason)) => println!("Update aborted: {}", reason),
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
}

fn send(mut module: Module, opts: &cli::SendOpts, config: Config) -> Result<(), anyhow::Error> {
    let image = fs::read(&opts.filename).with_context(|| {
        format!(
            "Failed to read image '{}'",
            opts.filename.as_path().display()
        )
    })?;

    println!("Connecting to {}", opts.address);

    let status = module.connect_to_address(opts.address, opts.address_type)?;

    if status != ConnectionStatus::Connected {
        bail!("Could not connect to {} ({:?})", opts.address, status);
    }

    let clock = *module.clock();
    let mut sender = Sender::new(module, clock, config);

    println!(
        "Sending {} ({} bytes) as {:?} version {}",
        opts.filename.as_path().display(),
        image.len(),
        opts.kind,
        opts.version
    );

    sender
        .send_image(&image, opts.kind, opts.version)
        .with_context(|| "Transfer failed")?;

    println!("Image committed by the receiver");

    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    use cli::Command;

    // Parse the command-line arguments
    let opts = cli::Opts::from_args();

    if opts.verbose && env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "debug");
    }

    // Create a logger with a timestamp that logs according to RUST_LOG
    pretty_env_logger::init_timed();

    let config = opts.config();
    let mut module = open_module(&opts, config)?;

    match &opts.command {
        Command::Receive(receive_opts) => receive(module, receive_opts, config)?,
        Command::Send(send_opts) => send(module, send_opts, config)?,
        Command::At { command } => {
            let response = module.send_command(&AtCommand::Raw(command.clone()))?;

            println!("OK{}", response.value_str());
        }
        Command::Info => print_info(&mut module)?,
        Command::Connect {
            address,
            address_type,
        } => {
            let status = module.connect_to_address(*address, *address_type)?;

            println!("{}: {:?}", address, status);
        }
        Command::RestoreDefaults => {
            module.restore_defaults()?;

            println!("Default settings restored");
        }
    }

    Ok(())
}
