/// Cut `s` to at most `max_chars` characters, appending `...` when anything was dropped.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((cut, _)) => {
            let mut out = s[..cut].to_string();
            out.push_str("...");
            out
        }
    }
}
