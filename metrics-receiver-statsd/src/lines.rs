/// Lines shorter than this are skipped without being parsed.
const MINIMUM_LINE_LEN: usize = 2;

/// Splits a datagram into the lines it carries.
///
/// Calling this again on the same datagram starts over from the first line.
pub fn split_lines(datagram: &[u8]) -> Lines<'_> {
    Lines { buf: datagram, offset: 0 }
}

/// An iterator over the lines of a single datagram.
///
/// Lines are separated by `\n`, which is stripped. The final line does not need a terminating `\n`, since StatsD
/// senders are not required to end a packet with one, and is yielded untouched. Lines of zero or one byte, such as
/// the gap between two consecutive newlines or a lone `\r`, are skipped.
#[derive(Clone, Debug)]
pub struct Lines<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Lines<'a> {
    fn next_raw_line(&mut self) -> Option<&'a [u8]> {
        if self.offset >= self.buf.len() {
            return None;
        }

        let remaining = &self.buf[self.offset..];
        match memchr::memchr(b'\n', remaining) {
            Some(idx) => {
                self.offset += idx + 1;
                Some(&remaining[..idx])
            }
            None => {
                self.offset = self.buf.len();
                Some(remaining)
            }
        }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.next_raw_line()?;
            if line.len() >= MINIMUM_LINE_LEN {
                return Some(line);
            }
        }
    }
}

impl std::iter::FusedIterator for Lines<'_> {}
