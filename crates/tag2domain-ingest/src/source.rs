//! Measurement stream reading.
//!
//! Documents in a stream are separated by
//! [`STREAM_SEPARATOR`](tag2domain_core::defaults::STREAM_SEPARATOR). A
//! stream without any separator is a single document. Documents are yielded
//! as they complete, so an unbounded stdin pipe is handled incrementally.
//!
//! Documents are raw bytes; decoding is left to the consumer so that one
//! undecodable document does not end the stream.

use std::io::{self, BufRead};

use tag2domain_core::defaults::STREAM_SEPARATOR;

/// Iterator over the documents of a separated stream.
pub struct DocumentStream<R> {
    reader: R,
    separator: Vec<u8>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead> DocumentStream<R> {
    pub fn new(reader: R) -> Self {
        Self::with_separator(reader, STREAM_SEPARATOR)
    }

    #[allow(dead_code)]
    pub fn with_separator(reader: R, separator: &str) -> Self {
        Self {
            reader,
            separator: separator.as_bytes().to_vec(),
            buf: Vec::new(),
            done: false,
        }
    }

    fn find_separator(&self) -> Option<usize> {
        if self.separator.is_empty() {
            return None;
        }
        self.buf
            .windows(self.separator.len())
            .position(|w| w == self.separator.as_slice())
    }
}

impl<R: BufRead> Iterator for DocumentStream<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pos) = self.find_separator() {
                let doc = self.buf[..pos].to_vec();
                self.buf.drain(..pos + self.separator.len());
                return Some(Ok(doc));
            }
            if self.done {
                if self.buf.is_empty() {
                    return None;
                }
                return Some(Ok(std::mem::take(&mut self.buf)));
            }
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => self.done = true,
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn docs(input: &[u8]) -> Vec<Vec<u8>> {
        DocumentStream::new(Cursor::new(input.to_vec()))
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    fn text_docs(input: &str) -> Vec<String> {
        docs(input.as_bytes())
            .into_iter()
            .map(|d| String::from_utf8(d).unwrap())
            .collect()
    }

    #[test]
    fn test_single_document_without_separator() {
        assert_eq!(text_docs("{\"a\": 1}\n"), vec!["{\"a\": 1}\n"]);
    }

    #[test]
    fn test_split_on_separator() {
        let input = format!("{{\"a\": 1}}{sep}\n{{\"b\": 2}}{sep}{{\"c\": 3}}", sep = STREAM_SEPARATOR);
        assert_eq!(text_docs(&input), vec!["{\"a\": 1}", "\n{\"b\": 2}", "{\"c\": 3}"]);
    }

    #[test]
    fn test_separator_spanning_lines_of_documents() {
        let input = format!("{{\n\"a\": 1\n}}\n{}\n{{\n\"b\": 2\n}}\n", STREAM_SEPARATOR);
        let out = text_docs(&input);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].trim(), "{\n\"a\": 1\n}");
        assert_eq!(out[1].trim(), "{\n\"b\": 2\n}");
    }

    #[test]
    fn test_trailing_separator_and_empty_input() {
        let input = format!("x{}", STREAM_SEPARATOR);
        assert_eq!(text_docs(&input), vec!["x"]);
        assert!(docs(b"").is_empty());
    }

    #[test]
    fn test_custom_separator() {
        let out: Vec<Vec<u8>> = DocumentStream::with_separator(Cursor::new("a|b|c"), "|")
            .map(Result::unwrap)
            .collect();
        assert_eq!(out, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_invalid_utf8_is_yielded_as_bytes() {
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(STREAM_SEPARATOR.as_bytes());
        input.extend_from_slice(b"{}");
        let out = docs(&input);
        assert_eq!(out, vec![b"\xff\xfe garbage\n".to_vec(), b"{}".to_vec()]);
    }
}
