/// Accumulates token pieces into a UTF-8 string.
///
/// A multi-byte character may be split across several pieces; its leading bytes are held back
/// until the rest arrives. Bytes that can never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
pub struct TokenDecoder {
    text: String,
    pending: Vec<u8>,
}

impl TokenDecoder {
    /// Creates an empty decoder.
    pub fn new() -> TokenDecoder {
        TokenDecoder::default()
    }

    /// Appends the bytes of one token piece.
    pub fn add_token(&mut self, piece: &[u8]) {
        self.pending.extend_from_slice(piece);

        let mut consumed = 0;
        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(s) => {
                    self.text.push_str(s);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    let valid = &self.pending[consumed..consumed + valid_len];

                    // SAFETY: `valid_up_to` bytes were just validated as UTF-8.
                    self.text
                        .push_str(unsafe { std::str::from_utf8_unchecked(valid) });
                    consumed += valid_len;

                    match err.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            consumed += len;
                        }
                        // An incomplete character at the end; wait for more bytes.
                        None => break,
                    }
                }
            }
        }

        self.pending.drain(..consumed);
    }

    /// The text decoded so far, excluding any incomplete trailing character.
    pub fn current_string(&self) -> &str {
        &self.text
    }

    /// Finishes decoding; incomplete trailing bytes become U+FFFD.
    pub fn into_string(mut self) -> String {
        self.text.push_str(&String::from_utf8_lossy(&self.pending));
        self.text
    }
}
