//! Matching of accumulated module output against the shapes a command expects

/// One valid response form: a fixed prefix followed by a value of `min..=max` bytes.
///
/// An exact response is a prefix with an empty value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Shape {
    pub prefix: &'static [u8],
    pub min: usize,
    pub max: usize,
}

impl Shape {
    pub const fn exact(bytes: &'static [u8]) -> Shape {
        Shape {
            prefix: bytes,
            min: 0,
            max: 0,
        }
    }

    pub const fn value(prefix: &'static [u8], min: usize, max: usize) -> Shape {
        Shape { prefix, min, max }
    }

    fn candidate(&self, buf: &[u8]) -> Candidate {
        if buf.len() < self.prefix.len() {
            return if self.prefix.starts_with(buf) {
                Candidate::Partial
            } else {
                Candidate::None
            };
        }

        if !buf.starts_with(self.prefix) {
            return Candidate::None;
        }

        let value_len = buf.len() - self.prefix.len();

        if value_len < self.min {
            Candidate::Partial
        } else if value_len <= self.max {
            Candidate::Complete {
                extendable: value_len < self.max,
            }
        } else {
            Candidate::None
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Candidate {
    None,
    Partial,
    Complete { extendable: bool },
}

/// The result of matching a buffer against a set of shapes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Match {
    /// `shape` matches the whole buffer. When `ambiguous`, more bytes could still turn the buffer
    /// into a longer valid response, so the caller should wait for the line to go quiet.
    Complete { shape: usize, ambiguous: bool },
    /// The buffer is a prefix of at least one shape
    Partial,
    /// No shape can match, no matter what arrives next
    Mismatch,
}

/// Matches the accumulated `buf` against `shapes`
pub fn match_shapes(buf: &[u8], shapes: &[Shape]) -> Match {
    let mut complete = None;
    let mut growable = false;

    for (index, shape) in shapes.iter().enumerate() {
        match shape.candidate(buf) {
            Candidate::None => {}
            Candidate::Partial => growable = true,
            Candidate::Complete { extendable } => {
                growable |= extendable;

                if complete.is_none() {
                    complete = Some(index);
                }
            }
        }
    }

    match complete {
        Some(shape) => Match::Complete {
            shape,
            ambiguous: growable,
        },
        None if growable => Match::Partial,
        None => Match::Mismatch,
    }
}

/// A response that completed one of the expected shapes
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AtResponse {
    /// Index of the matched shape in the expected list
    pub shape: usize,
    /// The bytes after the shape's prefix
    pub value: Vec<u8>,
}

impl AtResponse {
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SHAPES: [Shape; 2] = [Shape::exact(b"OK"), Shape::exact(b"OK+LOST")];

    #[test]
    fn it_should_report_partial_responses() {
        assert_eq!(match_shapes(b"", &TEST_SHAPES), Match::Partial);
        assert_eq!(match_shapes(b"O", &TEST_SHAPES), Match::Partial);
        assert_eq!(match_shapes(b"OK+LO", &TEST_SHAPES), Match::Partial);
    }

    #[test]
    fn it_should_flag_a_short_match_that_could_still_grow() {
        assert_eq!(
            match_shapes(b"OK", &TEST_SHAPES),
            Match::Complete {
                shape: 0,
                ambiguous: true
            }
        );
        assert_eq!(
            match_shapes(b"OK+LOST", &TEST_SHAPES),
            Match::Complete {
                shape: 1,
                ambiguous: false
            }
        );
    }

    #[test]
    fn it_should_reject_garbage() {
        assert_eq!(match_shapes(b"ERR", &TEST_SHAPES), Match::Mismatch);
        assert_eq!(match_shapes(b"OK+LOSTX", &TEST_SHAPES), Match::Mismatch);
    }

    #[test]
    fn it_should_match_variable_length_values() {
        let shapes = [Shape::value(b"OK+NAME:", 1, 12)];

        assert_eq!(match_shapes(b"OK+NAME:", &shapes), Match::Partial);
        assert_eq!(
            match_shapes(b"OK+NAME:HMSoft", &shapes),
            Match::Complete {
                shape: 0,
                ambiguous: true
            }
        );
        assert_eq!(
            match_shapes(b"OK+NAME:ABCDEFGHIJKL", &shapes),
            Match::Complete {
                shape: 0,
                ambiguous: false
            }
        );
        assert_eq!(match_shapes(b"OK+NAME:ABCDEFGHIJKLM", &shapes), Match::Mismatch);
    }

    #[test]
    fn it_should_match_fixed_size_values() {
        let shapes = [Shape::value(b"OK+ADDR:", 12, 12)];

        assert_eq!(match_shapes(b"OK+ADDR:A4C1", &shapes), Match::Partial);
        assert_eq!(
            match_shapes(b"OK+ADDR:A4C138FF0012", &shapes),
            Match::Complete {
                shape: 0,
                ambiguous: false
            }
        );
    }
}
