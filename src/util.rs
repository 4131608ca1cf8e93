/// Renders raw protocol bytes printable for logs, escaping anything that
/// isn't plain ASCII.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input.escape_ascii().to_string()
}
