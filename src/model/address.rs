//! Sender and recipient addresses (RFC 5322 §3.4, the forgiving subset).

/// A parsed email address.
///
/// Parsing never fails: anything that does not look like an address is kept
/// verbatim in `address` so the archive still shows what the sender wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EmailAddress {
    /// Human-readable display name (may be empty).
    pub display_name: String,
    /// The bare address (`user@domain`), or the raw text when unparseable.
    pub address: String,
}

impl EmailAddress {
    /// Parse `user@domain`, `<user@domain>` or `Name <user@domain>`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();

        if let (Some(open), Some(close)) = (trimmed.rfind('<'), trimmed.rfind('>')) {
            if close > open {
                return Self {
                    display_name: strip_quotes(&trimmed[..open]),
                    address: trimmed[open + 1..close].trim().to_string(),
                };
            }
        }

        // "user@domain (Real Name)" is still common on old lists
        if let (Some(open), true) = (trimmed.find('('), trimmed.ends_with(')')) {
            let address = trimmed[..open].trim();
            if address.contains('@') {
                return Self {
                    display_name: trimmed[open + 1..trimmed.len() - 1].trim().to_string(),
                    address: address.to_string(),
                };
            }
        }

        Self {
            display_name: String::new(),
            address: trimmed.to_string(),
        }
    }

    /// Parse a comma-separated address list, honoring quoted and bracketed commas.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        let mut out = Vec::new();
        let mut start = 0;
        let mut in_quotes = false;
        let mut in_angle = false;

        for (i, ch) in raw.char_indices() {
            match ch {
                '"' => in_quotes = !in_quotes,
                '<' if !in_quotes => in_angle = true,
                '>' if !in_quotes => in_angle = false,
                ',' if !in_quotes && !in_angle => {
                    push_nonempty(&mut out, &raw[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        push_nonempty(&mut out, &raw[start..]);
        out
    }

    /// Join a list back into a single header-style string.
    pub fn join(list: &[Self]) -> String {
        list.iter()
            .map(Self::display)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `"Display Name <address>"` or just `"address"`.
    pub fn display(&self) -> String {
        if self.display_name.is_empty() {
            self.address.clone()
        } else {
            format!("{} <{}>", self.display_name, self.address)
        }
    }
}

fn push_nonempty(out: &mut Vec<EmailAddress>, segment: &str) {
    let addr = EmailAddress::parse(segment);
    if !addr.address.is_empty() {
        out.push(addr);
    }
}

fn strip_quotes(s: &str) -> String {
    let t = s.trim();
    t.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(t)
        .trim()
        .to_string()
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}
