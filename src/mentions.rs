/// Collects every `@name` token in `text`, left to right.
///
/// A name is the run of ASCII word characters (`[A-Za-z0-9_]`) following an
/// `@`. Matching is purely textual: case is kept, duplicates are kept, and the
/// roster is never consulted.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut mentions = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'@' {
            i += 1;
            continue;
        }

        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && is_word_byte(bytes[end]) {
            end += 1;
        }

        if end > start {
            // Word bytes are ASCII, so both ends sit on char boundaries.
            mentions.push(text[start..end].to_string());
            i = end;
        } else {
            i = start;
        }
    }

    mentions
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}
