//! One IRC client connection.

use super::control::{self, ControlCommand, HELP_TEXT};
use super::hub::{ClientId, Outgoing};
use super::line::{client_prefix, IrcLine, MAX_CLIENT_LINE_LEN};
use super::reply::*;
use super::{
    canonical_channel, channel_topic, BridgeContext, CHANNELS, CONTACTS_BOT, CONTACTS_CHANNEL,
    PUBLIC_CHANNEL, SERVER_NAME,
};
use crate::contacts::{is_valid_nickname, TrustState};
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Idle time before the server pings a client (seconds).
pub const PING_AFTER_SECS: u64 = 90;

/// Idle time before a client is dropped (seconds).
pub const DISCONNECT_AFTER_SECS: u64 = 180;

const LIVENESS_TICK_SECS: u64 = 5;

/// Lines buffered for a client before output is dropped.
const OUTPUT_CAPACITY: usize = 1024;

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// Append to `buf` until a newline, end of stream or the line limit.
///
/// Partial reads stay in `buf`, so an interrupted call resumes where it
/// left off.
async fn read_line_capped(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    let limit = (MAX_CLIENT_LINE_LEN + 1).saturating_sub(buf.len()) as u64;
    reader.take(limit).read_until(b'\n', buf).await
}

enum Flow {
    Continue,
    Quit,
}

struct Client {
    id: ClientId,
    ctx: Arc<BridgeContext>,
    writer: OwnedWriteHalf,
    output: mpsc::Sender<String>,
    nick: Option<String>,
    user: Option<String>,
    password_ok: bool,
    registered: bool,
    quit_reason: String,
}

/// Serve a client until it quits, times out or the socket fails.
pub(crate) async fn serve(stream: TcpStream, ctx: Arc<BridgeContext>) {
    let id = NEXT_CLIENT.fetch_add(1, Ordering::Relaxed);
    let (reader, writer) = stream.into_split();
    let (output, rx) = mpsc::channel(OUTPUT_CAPACITY);
    let password_ok = ctx.password.is_none();

    let mut client = Client {
        id,
        ctx,
        writer,
        output,
        nick: None,
        user: None,
        password_ok,
        registered: false,
        quit_reason: "Client closed connection".to_string(),
    };

    if let Err(e) = client.run(reader, rx).await {
        debug!("IRC client {} failed: {}", id, e);
    }
    client.leave().await;
}

impl Client {
    async fn run(
        &mut self,
        reader: OwnedReadHalf,
        mut output: mpsc::Receiver<String>,
    ) -> Result<()> {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut tick = tokio::time::interval(Duration::from_secs(LIVENESS_TICK_SECS));
        let mut last_activity = Instant::now();
        let mut pinged = false;
        let mut discarding = false;

        loop {
            tokio::select! {
                read = read_line_capped(&mut reader, &mut buf) => {
                    if read? == 0 {
                        return Ok(());
                    }
                    last_activity = Instant::now();
                    pinged = false;
                    if buf.len() > MAX_CLIENT_LINE_LEN && buf.last() != Some(&b'\n') {
                        if !discarding {
                            warn!("IRC client {} sent an overlong line, discarding it", self.id);
                        }
                        discarding = true;
                        buf.clear();
                        continue;
                    }
                    if std::mem::take(&mut discarding) {
                        buf.clear();
                        continue;
                    }
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    if let Some(line) = IrcLine::parse(&text) {
                        if let Flow::Quit = self.handle(line).await? {
                            return Ok(());
                        }
                    }
                }
                Some(line) = output.recv() => self.write(&line).await?,
                _ = tick.tick() => {
                    let idle = last_activity.elapsed();
                    if idle >= Duration::from_secs(DISCONNECT_AFTER_SECS) {
                        self.quit_reason = "Ping timeout".to_string();
                        let _ = self.write("ERROR :Closing link: ping timeout").await;
                        return Ok(());
                    }
                    if idle >= Duration::from_secs(PING_AFTER_SECS) && !pinged {
                        self.write(&format!("PING :{}", SERVER_NAME)).await?;
                        pinged = true;
                    }
                }
            }
        }
    }

    async fn leave(&mut self) {
        if !self.registered {
            return;
        }
        self.ctx.hub.unregister(self.id).await;
        let line = format!(":{} QUIT :{}", self.prefix(), self.quit_reason);
        self.ctx.hub.publish(Outgoing::Raw(line), false).await;
        info!("IRC client {} left", self.id);
    }

    fn nick(&self) -> &str {
        self.nick.as_deref().unwrap_or("*")
    }

    fn prefix(&self) -> String {
        client_prefix(self.nick(), self.user.as_deref().unwrap_or("user"))
    }

    async fn write(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn numeric(&mut self, code: u16, rest: &str) -> Result<()> {
        let line = numeric(code, self.nick(), rest);
        self.write(&line).await
    }

    async fn notice(&mut self, text: &str) -> Result<()> {
        let line = format!(":{} NOTICE {} :{}", SERVER_NAME, self.nick(), text);
        self.write(&line).await
    }

    async fn handle(&mut self, line: IrcLine) -> Result<Flow> {
        match line.command.as_str() {
            "CAP" => self.cap(&line).await?,
            "PASS" => self.pass(&line).await?,
            "NICK" => return self.set_nick(&line).await,
            "USER" => return self.set_user(&line).await,
            "PING" => {
                let token = line.param(0).unwrap_or(SERVER_NAME).to_string();
                let pong = format!(":{} PONG {} :{}", SERVER_NAME, SERVER_NAME, token);
                self.write(&pong).await?;
            }
            "PONG" => {}
            "QUIT" => {
                if let Some(reason) = line.param(0) {
                    self.quit_reason = reason.to_string();
                }
                return Ok(Flow::Quit);
            }
            _ if !self.registered => {
                self.numeric(ERR_NOTREGISTERED, ":You have not registered")
                    .await?
            }
            "JOIN" => self.join(&line).await?,
            "PART" => {}
            "NAMES" => self.names(&line).await?,
            "TOPIC" => self.topic(&line).await?,
            "MODE" => self.mode(&line).await?,
            "WHO" => {
                let mask = line.param(0).unwrap_or("*").to_string();
                self.numeric(RPL_ENDOFWHO, &format!("{} :End of WHO list", mask))
                    .await?
            }
            "WHOIS" => self.whois(&line).await?,
            "PRIVMSG" => self.privmsg(&line, false).await?,
            "NOTICE" => self.privmsg(&line, true).await?,
            "HELP" => {
                for text in HELP_TEXT {
                    self.notice(text).await?;
                }
            }
            other => {
                let rest = format!("{} :Unknown command", other);
                self.numeric(ERR_UNKNOWNCOMMAND, &rest).await?
            }
        }
        Ok(Flow::Continue)
    }

    async fn cap(&mut self, line: &IrcLine) -> Result<()> {
        let sub = line.param(0).unwrap_or_default().to_ascii_uppercase();
        let reply = match sub.as_str() {
            "LS" | "LIST" => format!(":{} CAP {} {} :", SERVER_NAME, self.nick(), sub),
            "REQ" => format!(
                ":{} CAP {} NAK :{}",
                SERVER_NAME,
                self.nick(),
                line.param(1).unwrap_or_default()
            ),
            _ => return Ok(()),
        };
        self.write(&reply).await
    }

    async fn pass(&mut self, line: &IrcLine) -> Result<()> {
        if self.registered {
            return self
                .numeric(ERR_ALREADYREGISTRED, ":You may not reregister")
                .await;
        }
        let Some(given) = line.param(0) else {
            return self
                .numeric(ERR_NEEDMOREPARAMS, "PASS :Not enough parameters")
                .await;
        };
        if let Some(expected) = &self.ctx.password {
            self.password_ok = given == expected;
        }
        Ok(())
    }

    async fn nick_taken(&self, nick: &str) -> Result<bool> {
        if nick.eq_ignore_ascii_case(CONTACTS_BOT) || self.ctx.hub.nick_in_use(nick, self.id).await
        {
            return Ok(true);
        }
        Ok(self.ctx.daemon.lookup(nick).await?.is_some())
    }

    async fn set_nick(&mut self, line: &IrcLine) -> Result<Flow> {
        let Some(nick) = line.param(0).map(str::to_string) else {
            self.numeric(ERR_NONICKNAMEGIVEN, ":No nickname given").await?;
            return Ok(Flow::Continue);
        };
        if !is_valid_nickname(&nick) {
            let rest = format!("{} :Erroneous nickname", nick);
            self.numeric(ERR_ERRONEUSNICKNAME, &rest).await?;
            return Ok(Flow::Continue);
        }
        if self.nick_taken(&nick).await? {
            let rest = format!("{} :Nickname is already in use", nick);
            self.numeric(ERR_NICKNAMEINUSE, &rest).await?;
            return Ok(Flow::Continue);
        }

        if !self.registered {
            self.nick = Some(nick);
            return self.try_register().await;
        }

        if !self.ctx.hub.rename(self.id, &nick).await {
            let rest = format!("{} :Nickname is already in use", nick);
            self.numeric(ERR_NICKNAMEINUSE, &rest).await?;
            return Ok(Flow::Continue);
        }
        let change = format!(":{} NICK :{}", self.prefix(), nick);
        self.nick = Some(nick);
        self.ctx.hub.publish(Outgoing::Raw(change), false).await;
        Ok(Flow::Continue)
    }

    async fn set_user(&mut self, line: &IrcLine) -> Result<Flow> {
        if self.registered {
            self.numeric(ERR_ALREADYREGISTRED, ":You may not reregister")
                .await?;
            return Ok(Flow::Continue);
        }
        if line.params.len() < 4 {
            self.numeric(ERR_NEEDMOREPARAMS, "USER :Not enough parameters")
                .await?;
            return Ok(Flow::Continue);
        }
        self.user = Some(line.params[0].clone());
        self.try_register().await
    }

    async fn try_register(&mut self) -> Result<Flow> {
        if self.user.is_none() {
            return Ok(Flow::Continue);
        }
        let Some(nick) = self.nick.clone() else {
            return Ok(Flow::Continue);
        };
        if !self.password_ok {
            self.numeric(ERR_PASSWDMISMATCH, ":Password incorrect").await?;
            self.write("ERROR :Closing link: password incorrect").await?;
            return Ok(Flow::Quit);
        }

        let Some(replay) = self
            .ctx
            .hub
            .register(self.id, &nick, self.output.clone())
            .await
        else {
            let rest = format!("{} :Nickname is already in use", nick);
            self.numeric(ERR_NICKNAMEINUSE, &rest).await?;
            self.nick = None;
            return Ok(Flow::Continue);
        };
        self.registered = true;
        info!("IRC client {} registered", self.id);

        for line in welcome(&nick) {
            self.write(&line).await?;
        }
        for channel in CHANNELS {
            self.join_burst(channel).await?;
        }
        for outgoing in replay {
            for line in outgoing.render(&nick) {
                self.write(&line).await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Nicks shown in a channel: local clients and authorized contacts.
    async fn channel_members(&self, channel: &str) -> Result<Vec<String>> {
        let mut members = self.ctx.hub.nicks().await;
        if channel == CONTACTS_CHANNEL {
            members.push(CONTACTS_BOT.to_string());
        }
        members.extend(
            self.ctx
                .daemon
                .contacts()
                .await?
                .into_iter()
                .filter(|v| v.contact.state == TrustState::Authorized)
                .filter_map(|v| v.contact.nickname),
        );
        Ok(members)
    }

    async fn join_burst(&mut self, channel: &'static str) -> Result<()> {
        let join = format!(":{} JOIN {}", self.prefix(), channel);
        self.write(&join).await?;
        if let Some(topic) = channel_topic(channel) {
            self.numeric(RPL_TOPIC, &format!("{} :{}", channel, topic))
                .await?;
        }
        self.names_reply(channel).await
    }

    async fn names_reply(&mut self, channel: &'static str) -> Result<()> {
        let members = self.channel_members(channel).await?;
        for line in names(self.nick(), channel, &members) {
            self.write(&line).await?;
        }
        Ok(())
    }

    async fn join(&mut self, line: &IrcLine) -> Result<()> {
        let Some(list) = line.param(0).map(str::to_string) else {
            return self
                .numeric(ERR_NEEDMOREPARAMS, "JOIN :Not enough parameters")
                .await;
        };
        for name in list.split(',').filter(|n| !n.is_empty() && *n != "0") {
            match canonical_channel(name) {
                Some(channel) => self.join_burst(channel).await?,
                None => {
                    let rest = format!("{} :No such channel", name);
                    self.numeric(ERR_NOSUCHCHANNEL, &rest).await?
                }
            }
        }
        Ok(())
    }

    async fn names(&mut self, line: &IrcLine) -> Result<()> {
        let requested: Vec<String> = match line.param(0) {
            Some(list) => list.split(',').map(str::to_string).collect(),
            None => CHANNELS.iter().map(|c| c.to_string()).collect(),
        };
        for name in requested {
            match canonical_channel(&name) {
                Some(channel) => self.names_reply(channel).await?,
                None => {
                    let rest = format!("{} :End of NAMES list", name);
                    self.numeric(RPL_ENDOFNAMES, &rest).await?
                }
            }
        }
        Ok(())
    }

    async fn topic(&mut self, line: &IrcLine) -> Result<()> {
        let Some(name) = line.param(0).map(str::to_string) else {
            return self
                .numeric(ERR_NEEDMOREPARAMS, "TOPIC :Not enough parameters")
                .await;
        };
        match canonical_channel(&name).and_then(|c| channel_topic(c).map(|t| (c, t))) {
            Some((channel, topic)) => {
                self.numeric(RPL_TOPIC, &format!("{} :{}", channel, topic))
                    .await
            }
            None => {
                self.numeric(ERR_NOSUCHCHANNEL, &format!("{} :No such channel", name))
                    .await
            }
        }
    }

    async fn mode(&mut self, line: &IrcLine) -> Result<()> {
        let Some(target) = line.param(0).map(str::to_string) else {
            return self
                .numeric(ERR_NEEDMOREPARAMS, "MODE :Not enough parameters")
                .await;
        };
        // Mode changes are accepted silently.
        if line.params.len() > 1 {
            return Ok(());
        }
        if target.starts_with('#') {
            match canonical_channel(&target) {
                Some(channel) => {
                    self.numeric(RPL_CHANNELMODEIS, &format!("{} +nt", channel))
                        .await
                }
                None => {
                    let rest = format!("{} :No such channel", target);
                    self.numeric(ERR_NOSUCHCHANNEL, &rest).await
                }
            }
        } else {
            self.numeric(RPL_UMODEIS, "+i").await
        }
    }

    async fn whois(&mut self, line: &IrcLine) -> Result<()> {
        let Some(target) = line.params.last().cloned() else {
            return self
                .numeric(ERR_NONICKNAMEGIVEN, ":No nickname given")
                .await;
        };

        let channels = format!("{} {}", CONTACTS_CHANNEL, PUBLIC_CHANNEL);
        if let Some(view) = self.ctx.daemon.lookup(&target).await? {
            let name = view.contact.display_name().to_string();
            let user = format!(
                "{} {} {} * :{}",
                name, name, view.contact.address, view.contact.state
            );
            self.numeric(RPL_WHOISUSER, &user).await?;
            self.numeric(RPL_WHOISSERVER, &format!("{} {} :I2P", name, SERVER_NAME))
                .await?;
            if view.contact.state == TrustState::Authorized {
                self.numeric(RPL_WHOISCHANNELS, &format!("{} :{}", name, channels))
                    .await?;
            }
        } else if target.eq_ignore_ascii_case(self.nick())
            || self.ctx.hub.nick_in_use(&target, self.id).await
        {
            let user = format!("{} {} {} * :{}", target, target, SERVER_NAME, target);
            self.numeric(RPL_WHOISUSER, &user).await?;
            self.numeric(RPL_WHOISSERVER, &format!("{} {} :kote", target, SERVER_NAME))
                .await?;
            self.numeric(RPL_WHOISCHANNELS, &format!("{} :{}", target, channels))
                .await?;
        } else {
            let rest = format!("{} :No such nick/channel", target);
            self.numeric(ERR_NOSUCHNICK, &rest).await?;
        }
        self.numeric(RPL_ENDOFWHOIS, &format!("{} :End of WHOIS list", target))
            .await
    }

    /// Show a channel line typed here to the other clients.
    async fn echo_channel(&self, channel: &str, text: &str) {
        let outgoing = Outgoing::Channel {
            from: self.prefix(),
            channel: channel.to_string(),
            text: text.to_string(),
        };
        self.ctx.hub.echo(self.id, outgoing).await;
    }

    async fn privmsg(&mut self, line: &IrcLine, notice: bool) -> Result<()> {
        let Some(target) = line.param(0).map(str::to_string) else {
            if notice {
                return Ok(());
            }
            let rest = format!(":No recipient given ({})", line.command);
            return self.numeric(ERR_NORECIPIENT, &rest).await;
        };
        let Some(text) = line.param(1).filter(|t| !t.is_empty()).map(str::to_string) else {
            if notice {
                return Ok(());
            }
            return self.numeric(ERR_NOTEXTTOSEND, ":No text to send").await;
        };

        if target.eq_ignore_ascii_case(PUBLIC_CHANNEL) {
            self.echo_channel(PUBLIC_CHANNEL, &text).await;
            if let Err(e) = self.ctx.daemon.broadcast(text).await {
                self.notice(&format!("Broadcast failed: {}", e)).await?;
            }
            return Ok(());
        }

        if target.eq_ignore_ascii_case(CONTACTS_CHANNEL) || target.eq_ignore_ascii_case(CONTACTS_BOT)
        {
            if target.starts_with('#') {
                self.echo_channel(CONTACTS_CHANNEL, &text).await;
            }
            if !notice {
                self.control(&text).await?;
            }
            return Ok(());
        }

        if target.starts_with('#') {
            if notice {
                return Ok(());
            }
            let rest = format!("{} :No such channel", target);
            return self.numeric(ERR_NOSUCHCHANNEL, &rest).await;
        }

        match self.ctx.daemon.lookup(&target).await? {
            Some(view) => {
                let echo = format!(
                    ":{} PRIVMSG {} :{}",
                    self.prefix(),
                    view.contact.display_name(),
                    text
                );
                self.ctx.hub.echo(self.id, Outgoing::Raw(echo)).await;
                let address = view.contact.address.to_string();
                if let Err(e) = self.ctx.daemon.send_text(address, text).await {
                    self.notice(&format!("Cannot send to {}: {}", target, e))
                        .await?;
                }
                Ok(())
            }
            None if notice => Ok(()),
            None => {
                let rest = format!("{} :No such nick/channel", target);
                self.numeric(ERR_NOSUCHNICK, &rest).await
            }
        }
    }

    async fn control(&mut self, text: &str) -> Result<()> {
        let nick = self.nick().to_string();
        let result = match ControlCommand::parse(text) {
            Ok(command) => control::execute(command, &self.ctx.daemon, &nick).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(lines) => {
                for outgoing in lines {
                    self.ctx.hub.publish(outgoing, false).await;
                }
                Ok(())
            }
            Err(e) => self.notice(&e.to_string()).await,
        }
    }
}
