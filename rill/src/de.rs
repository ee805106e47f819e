// Structural scanning of raw bencode.
//
// Typed decoding goes through serde_bencode, but some callers need the exact
// bytes a value occupied: the info hash is taken over the info dictionary as
// it was serialized, and extension messages carry raw data after a dictionary.

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScanError {

    #[error("bencode ended unexpectedly")]
    Truncated,

    #[error("invalid bencode token at byte {0}")]
    InvalidToken(usize),

    #[error("expected a bencoded dictionary")]
    NotADict,
}

type Result<T> = std::result::Result<T, ScanError>;

// Returns the length in bytes of the first complete bencoded value in buf.
pub fn value_len(buf: &[u8]) -> Result<usize> {
    // Number of open lists/dicts.
    let mut depth = 0usize;
    let mut i = 0;

    loop {
        let token = *buf.get(i).ok_or(ScanError::Truncated)?;
        match token {
            b'd' | b'l' => {
                depth += 1;
                i += 1;
                continue;
            }
            b'e' if depth > 0 => {
                depth -= 1;
                i += 1;
            }
            b'i' => {
                let end = find(buf, i + 1, b'e')?;
                let digits = &buf[i + 1..end];
                let digits = digits.strip_prefix(b"-").unwrap_or(digits);
                if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
                    return Err(ScanError::InvalidToken(i));
                }
                i = end + 1;
            }
            b'0'..=b'9' => {
                let colon = find(buf, i, b':')?;
                let len: usize = std::str::from_utf8(&buf[i..colon])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(ScanError::InvalidToken(i))?;
                i = colon
                    .checked_add(1 + len)
                    .ok_or(ScanError::InvalidToken(i))?;
                if i > buf.len() {
                    return Err(ScanError::Truncated);
                }
            }
            _ => return Err(ScanError::InvalidToken(i)),
        }

        if depth == 0 {
            return Ok(i);
        }
    }
}

// Finds the raw value stored under key in the top level dictionary of buf.
pub fn dict_value<'a>(buf: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>> {
    if buf.first() != Some(&b'd') {
        return Err(ScanError::NotADict);
    }

    let mut i = 1;
    loop {
        match buf.get(i) {
            None => return Err(ScanError::Truncated),
            Some(b'e') => return Ok(None),
            Some(b'0'..=b'9') => {}
            Some(_) => return Err(ScanError::InvalidToken(i)),
        }
        // Keys are byte strings.
        let key_len = value_len(&buf[i..])?;
        let colon = find(buf, i, b':')?;
        let found = &buf[colon + 1..i + key_len];
        i += key_len;

        let val_len = value_len(&buf[i..])?;
        if found == key {
            return Ok(Some(&buf[i..i + val_len]));
        }
        i += val_len;
    }
}

fn find(buf: &[u8], from: usize, byte: u8) -> Result<usize> {
    buf.get(from..)
        .and_then(|rest| rest.iter().position(|b| *b == byte))
        .map(|pos| from + pos)
        .ok_or(ScanError::Truncated)
}
