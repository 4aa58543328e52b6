//! IRC message lines.

/// Longest line sent to a client, CRLF included.
pub const MAX_LINE_LEN: usize = 512;

/// Longest line accepted from a client, CRLF and message tags included.
pub const MAX_CLIENT_LINE_LEN: usize = 8192;

/// Smallest text chunk per PRIVMSG, even under an oversized prefix.
const MIN_CHUNK_LEN: usize = 64;

/// A line received from an IRC client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    /// Command, upper-cased.
    pub command: String,
    /// Parameters; the trailing `:` parameter is the last one.
    pub params: Vec<String>,
}

impl IrcLine {
    /// Parse a client line. Returns `None` for blank lines.
    ///
    /// A leading `:prefix` is ignored, as clients have no business sending
    /// one.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_matches(|c| c == '\r' || c == '\n').trim_start();
        if let Some(prefixed) = rest.strip_prefix(':') {
            rest = prefixed.split_once(' ').map_or("", |(_, r)| r).trim_start();
        }
        if rest.is_empty() {
            return None;
        }

        let (command, args) = match rest.split_once(' ') {
            Some((command, args)) => (command, args),
            None => (rest, ""),
        };

        let mut params = Vec::new();
        if let Some(trailing) = args.strip_prefix(':') {
            params.push(trailing.to_string());
        } else {
            let (middle, trailing) = match args.split_once(" :") {
                Some((middle, trailing)) => (middle, Some(trailing)),
                None => (args, None),
            };
            params.extend(middle.split_whitespace().map(str::to_string));
            if let Some(trailing) = trailing {
                params.push(trailing.to_string());
            }
        }

        Some(Self {
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Parameter by index.
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

/// Full prefix of a contact: `nick!nick@address`.
pub fn contact_prefix(nick: &str, address: &str) -> String {
    format!("{}!{}@{}", nick, nick, address)
}

/// Full prefix of a local client: `nick!user@kote`.
pub fn client_prefix(nick: &str, user: &str) -> String {
    format!("{}!{}@{}", nick, user, super::SERVER_NAME)
}

/// `:from PRIVMSG target :text`, one line per line of `text`. Long lines
/// are cut on character boundaries so each stays within [`MAX_LINE_LEN`].
pub fn privmsg(from: &str, target: &str, text: &str) -> Vec<String> {
    let head = format!(":{} PRIVMSG {} :", from, target);
    let budget = MAX_LINE_LEN
        .saturating_sub(head.len() + 2)
        .max(MIN_CHUNK_LEN);

    text.split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .flat_map(|line| chunks(line, budget))
        .map(|chunk| format!("{}{}", head, chunk))
        .collect()
}

/// Split `text` into pieces of at most `budget` bytes.
fn chunks(mut text: &str, budget: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    while text.len() > budget {
        let mut cut = budget;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        let (piece, rest) = text.split_at(cut);
        pieces.push(piece);
        text = rest;
    }
    pieces.push(text);
    pieces
}

/// A CTCP ACTION body.
pub fn action(text: &str) -> String {
    format!("\x01ACTION {}\x01", text)
}
