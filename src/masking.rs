/// Redact credential attributes (`PWD`, `Password`) of an ODBC connection string.
///
/// Braced values may contain `;`, so the string is walked attribute by
/// attribute rather than split naively.
pub fn mask_connection_string(conn_str: &str) -> String {
    let mut out = String::with_capacity(conn_str.len());
    let mut rest = conn_str;

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            out.push_str(rest);
            break;
        };
        let key = &rest[..eq];
        let after = &rest[eq + 1..];
        let value_len = attribute_value_len(after);
        let value = &after[..value_len];
        let is_secret = matches!(key.trim().to_ascii_lowercase().as_str(), "pwd" | "password");

        out.push_str(key);
        out.push('=');
        out.push_str(if is_secret { "[REDACTED]" } else { value });

        rest = &after[value_len..];
        if let Some(stripped) = rest.strip_prefix(';') {
            out.push(';');
            rest = stripped;
        }
    }

    out
}

/// Length of the attribute value at the start of `s`, honoring `{...}` quoting
/// where `}}` is an escaped brace.
fn attribute_value_len(s: &str) -> usize {
    if !s.starts_with('{') {
        return s.find(';').unwrap_or(s.len());
    }
    let bytes = s.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == b'}' {
            if bytes.get(i + 1) == Some(&b'}') {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    s.len()
}
