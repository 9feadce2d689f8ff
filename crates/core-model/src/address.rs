/// One entry of an address header such as `To:` or `From:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub display_name: String,
    pub address: String,
}

/// Splits a header like `"Doe, Jane" <jane@x.com>, bob@y.com` into mailboxes.
///
/// Addresses are lowercased; entries without an `@` are dropped.
pub fn parse_mailbox_list(header: &str) -> Vec<Mailbox> {
    split_header(header)
        .into_iter()
        .filter_map(|entry| parse_mailbox(&entry))
        .collect()
}

pub fn parse_mailbox(entry: &str) -> Option<Mailbox> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    let (name, addr) = match (entry.rfind('<'), entry.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            (entry[..open].trim(), entry[open + 1..close].trim())
        }
        _ => ("", entry),
    };
    let address = normalize_address(addr);
    if !address.contains('@') {
        return None;
    }
    Some(Mailbox {
        display_name: name.trim_matches('"').trim().to_string(),
        address,
    })
}

pub fn normalize_address(addr: &str) -> String {
    addr.trim()
        .trim_start_matches("mailto:")
        .trim_matches(|c| c == '<' || c == '>')
        .to_lowercase()
}

pub fn local_part(addr: &str) -> &str {
    addr.split_once('@').map(|(local, _)| local).unwrap_or(addr)
}

pub fn domain(addr: &str) -> Option<&str> {
    addr.split_once('@').map(|(_, domain)| domain)
}

fn split_header(header: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    for ch in header.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(ch);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(ch);
            }
            ',' | ';' if !in_quotes && !in_angle => {
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    out.push(current);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_named_entries() {
        let list = parse_mailbox_list("Jane Doe <Jane.Doe@X.com>, bob@y.com");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].display_name, "Jane Doe");
        assert_eq!(list[0].address, "jane.doe@x.com");
        assert_eq!(list[1].display_name, "");
        assert_eq!(list[1].address, "bob@y.com");
    }

    #[test]
    fn quoted_comma_stays_in_name() {
        let list = parse_mailbox_list(r#""Doe, Jane" <jane@x.com>; ops@y.com"#);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].display_name, "Doe, Jane");
        assert_eq!(list[1].address, "ops@y.com");
    }

    #[test]
    fn drops_entries_without_at() {
        assert!(parse_mailbox_list("undisclosed-recipients:;").is_empty());
        assert!(parse_mailbox_list("").is_empty());
    }

    #[test]
    fn local_part_and_domain() {
        assert_eq!(local_part("j.smith@newdomain.com"), "j.smith");
        assert_eq!(domain("j.smith@newdomain.com"), Some("newdomain.com"));
        assert_eq!(domain("nobody"), None);
    }
}
