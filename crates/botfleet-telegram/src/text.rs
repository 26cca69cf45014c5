/// Split `s` into chunks of at most `max_chars` characters, preferring to
/// break after a newline when one falls in the second half of a chunk.
pub fn split_message(s: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut out = Vec::new();
    let mut rest: Vec<char> = s.chars().collect();

    while rest.len() > max_chars {
        let window = &rest[..max_chars];
        let cut = window
            .iter()
            .rposition(|c| *c == '\n')
            .filter(|i| *i >= max_chars / 2)
            .map(|i| i + 1)
            .unwrap_or(max_chars);
        out.push(rest[..cut].iter().collect());
        rest.drain(..cut);
    }
    if !rest.is_empty() || out.is_empty() {
        out.push(rest.into_iter().collect());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 10), vec!["hello".to_string()]);
    }

    #[test]
    fn long_text_is_cut_at_limit() {
        let parts = split_message("abcdefghij", 4);
        assert_eq!(parts, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn prefers_newline_in_second_half() {
        let parts = split_message("abc\ndefgh", 6);
        assert_eq!(parts, vec!["abc\n", "defgh"]);
    }

    #[test]
    fn counts_characters_not_bytes() {
        let parts = split_message("ééééé", 2);
        assert_eq!(parts, vec!["éé", "éé", "é"]);
    }
}
