//! Numeric replies.

use super::SERVER_NAME;

pub const RPL_WELCOME: u16 = 1;
pub const RPL_YOURHOST: u16 = 2;
pub const RPL_CREATED: u16 = 3;
pub const RPL_MYINFO: u16 = 4;
pub const RPL_LUSERCLIENT: u16 = 251;
pub const RPL_UMODEIS: u16 = 221;
pub const RPL_WHOISUSER: u16 = 311;
pub const RPL_WHOISSERVER: u16 = 312;
pub const RPL_ENDOFWHO: u16 = 315;
pub const RPL_ENDOFWHOIS: u16 = 318;
pub const RPL_WHOISCHANNELS: u16 = 319;
pub const RPL_CHANNELMODEIS: u16 = 324;
pub const RPL_TOPIC: u16 = 332;
pub const RPL_NAMREPLY: u16 = 353;
pub const RPL_ENDOFNAMES: u16 = 366;
pub const ERR_NOSUCHNICK: u16 = 401;
pub const ERR_NOSUCHCHANNEL: u16 = 403;
pub const ERR_NORECIPIENT: u16 = 411;
pub const ERR_NOTEXTTOSEND: u16 = 412;
pub const ERR_UNKNOWNCOMMAND: u16 = 421;
pub const ERR_NOMOTD: u16 = 422;
pub const ERR_NONICKNAMEGIVEN: u16 = 431;
pub const ERR_ERRONEUSNICKNAME: u16 = 432;
pub const ERR_NICKNAMEINUSE: u16 = 433;
pub const ERR_NOTREGISTERED: u16 = 451;
pub const ERR_NEEDMOREPARAMS: u16 = 461;
pub const ERR_ALREADYREGISTRED: u16 = 462;
pub const ERR_PASSWDMISMATCH: u16 = 464;

/// `:kote <code> <nick> <rest>`.
pub fn numeric(code: u16, nick: &str, rest: &str) -> String {
    format!(":{} {:03} {} {}", SERVER_NAME, code, nick, rest)
}

/// Registration burst: 001-004, 251 and 422.
pub fn welcome(nick: &str) -> Vec<String> {
    vec![
        numeric(RPL_WELCOME, nick, ":Hi, welcome to IRC"),
        numeric(
            RPL_YOURHOST,
            nick,
            &format!(":Your host is {}, running version kote-{}", SERVER_NAME, crate::VERSION),
        ),
        numeric(RPL_CREATED, nick, ":This server was created sometime"),
        numeric(
            RPL_MYINFO,
            nick,
            &format!("{} kote-{} o o", SERVER_NAME, crate::VERSION),
        ),
        numeric(
            RPL_LUSERCLIENT,
            nick,
            ":There are 1 users and 0 services on 1 server",
        ),
        numeric(ERR_NOMOTD, nick, ":MOTD File is missing"),
    ]
}

/// 353 lines for `names`, each kept under the 512-byte line limit, followed
/// by 366.
pub fn names(nick: &str, channel: &str, names: &[String]) -> Vec<String> {
    let head = numeric(RPL_NAMREPLY, nick, &format!("= {} :", channel));
    let limit = super::line::MAX_LINE_LEN - 2;

    let mut lines = Vec::new();
    let mut current = head.clone();
    for name in names {
        if current.len() > head.len() && current.len() + 1 + name.len() > limit {
            lines.push(std::mem::replace(&mut current, head.clone()));
        }
        if current.len() > head.len() {
            current.push(' ');
        }
        current.push_str(name);
    }
    if current.len() > head.len() {
        lines.push(current);
    }

    lines.push(numeric(
        RPL_ENDOFNAMES,
        nick,
        &format!("{} :End of NAMES list", channel),
    ));
    lines
}
