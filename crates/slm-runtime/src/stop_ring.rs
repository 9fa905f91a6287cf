//! O(1)-per-write stop-string detector. This is a deliberate redesign of the
//! teacher's `check_stop_conditions`, which rescans the whole accumulated
//! response string (`O(response_len)`) on every appended piece. The spec
//! mandates a fixed-size circular buffer instead: `write` is `O(|piece|)`,
//! `check` is `O(sum of stop lengths)`, independent of how much text has
//! already been generated.

/// Circular byte buffer sized to the longest configured stop string, plus
/// the literal stop list it's checked against.
pub struct StopRing {
    buf: Vec<u8>,
    cursor: usize,
    fill: usize,
    stops: Vec<Vec<u8>>,
}

impl StopRing {
    /// Returns `None` ("no detector") when `stops` is empty — callers skip
    /// the check entirely in that case, per spec section 4.8.
    #[must_use]
    pub fn new(stops: &[String]) -> Option<Self> {
        if stops.is_empty() {
            return None;
        }
        let max_len = stops.iter().map(|s| s.len()).max().unwrap_or(0);
        if max_len == 0 {
            return None;
        }
        Some(Self {
            buf: vec![0u8; max_len],
            cursor: 0,
            fill: 0,
            stops: stops.iter().map(|s| s.as_bytes().to_vec()).collect(),
        })
    }

    /// Copy `piece`'s bytes into the ring in order, advancing the cursor
    /// modulo the ring's length.
    pub fn write(&mut self, piece: &[u8]) {
        let len = self.buf.len();
        for &byte in piece {
            self.buf[self.cursor] = byte;
            self.cursor = (self.cursor + 1) % len;
        }
        self.fill = (self.fill + piece.len()).min(len);
    }

    /// Returns the matched stop's byte length if any configured stop string
    /// is present at the tail of the written stream, else `None`.
    #[must_use]
    pub fn check(&self) -> Option<usize> {
        let len = self.buf.len();
        for stop in &self.stops {
            if stop.len() > self.fill {
                continue;
            }
            let matches = (0..stop.len()).all(|i| {
                let ring_idx = (self.cursor + len - 1 - i) % len;
                self.buf[ring_idx] == stop[stop.len() - 1 - i]
            });
            if matches {
                return Some(stop.len());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stop_list_yields_no_detector() {
        assert!(StopRing::new(&[]).is_none());
    }

    #[test]
    fn exact_match_within_one_piece() {
        let mut ring = StopRing::new(&["END".to_string()]).unwrap();
        ring.write(b"hello END");
        assert_eq!(ring.check(), Some(3));
    }

    #[test]
    fn match_spanning_two_pieces() {
        let mut ring = StopRing::new(&["END".to_string()]).unwrap();
        ring.write(b"hello EN");
        assert_eq!(ring.check(), None);
        ring.write(b"D");
        assert_eq!(ring.check(), Some(3));
    }

    #[test]
    fn no_match_on_unrelated_tail() {
        let mut ring = StopRing::new(&["END".to_string()]).unwrap();
        ring.write(b"hello there");
        assert_eq!(ring.check(), None);
    }

    #[test]
    fn multiple_stops_first_match_wins() {
        let mut ring = StopRing::new(&["END".to_string(), "."]).unwrap();
        ring.write(b"the answer is.");
        assert_eq!(ring.check(), Some(1));
    }

    #[test]
    fn ring_wraps_past_capacity() {
        let mut ring = StopRing::new(&["AB".to_string()]).unwrap();
        ring.write(b"XXXXXXXXXXAB");
        assert_eq!(ring.check(), Some(2));
    }
}
