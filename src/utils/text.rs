/// Prefixes every line of `body` with `width` spaces. A single trailing
/// newline does not produce an extra indented blank line.
pub fn indent_block(body: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    let trimmed = body.strip_suffix('\n').unwrap_or(body);
    let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
    trimmed
        .split('\n')
        .map(|line| {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", pad, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
