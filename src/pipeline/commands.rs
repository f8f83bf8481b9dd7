//! Chat commands and who may run them.

use tracing::info;

use super::{
    format_translation, DropReason, MessagePipeline, PipelineError, PipelineOutcome,
    IGNORE_LIST_PAGE_SIZE,
};
use crate::channel_config::{normalize_channel, normalize_user, ChannelConfig, ConfigKey};
use crate::credentials::RefreshError;
use crate::transport::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Translate,
    Config,
    Exclude,
    Include,
    GlobalIgnore,
    Help,
    RefreshToken,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::Translate,
        Command::Config,
        Command::Exclude,
        Command::Include,
        Command::GlobalIgnore,
        Command::Help,
        Command::RefreshToken,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Translate => "translate",
            Command::Config => "config",
            Command::Exclude => "exclude",
            Command::Include => "include",
            Command::GlobalIgnore => "globalignore",
            Command::Help => "help",
            Command::RefreshToken => "refreshtoken",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        Command::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(token))
    }
}

/// Roles of the user issuing a command, resolved against the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub is_moderator: bool,
    pub is_channel_owner: bool,
    pub is_bot_owner: bool,
}

impl Requester {
    /// The channel owner is the user named like the channel. Without a
    /// configured bot owner, each channel owner stands in for one.
    pub fn resolve(msg: &ChatMessage, bot_owner: Option<&str>) -> Self {
        let user = normalize_user(&msg.username);
        let is_channel_owner = user == normalize_channel(&msg.channel);
        let is_bot_owner = match bot_owner {
            Some(owner) => normalize_user(owner) == user,
            None => is_channel_owner,
        };
        Self {
            is_moderator: msg.is_moderator,
            is_channel_owner,
            is_bot_owner,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.is_moderator || self.is_channel_owner || self.is_bot_owner
    }

    pub fn may_run(&self, command: Command) -> bool {
        match command {
            Command::Translate | Command::Help => true,
            Command::Config | Command::Exclude | Command::Include => {
                self.is_moderator || self.is_channel_owner
            }
            Command::GlobalIgnore => self.is_bot_owner,
            Command::RefreshToken => self.is_channel_owner,
        }
    }
}

fn reply(line: String) -> Result<PipelineOutcome, PipelineError> {
    Ok(PipelineOutcome::Reply(vec![line]))
}

fn dropped(reason: DropReason) -> Result<PipelineOutcome, PipelineError> {
    Ok(PipelineOutcome::Dropped(reason))
}

impl MessagePipeline {
    pub(super) async fn run_command(
        &self,
        msg: &ChatMessage,
        config: &ChannelConfig,
        body: &str,
    ) -> Result<PipelineOutcome, PipelineError> {
        if !config.respond_to_commands {
            return dropped(DropReason::CommandsDisabled);
        }

        let mut tokens = body.split_whitespace();
        let Some(command) = tokens.next().and_then(Command::parse) else {
            return dropped(DropReason::UnknownCommand);
        };
        let args: Vec<&str> = tokens.collect();

        let requester = Requester::resolve(msg, self.settings.bot_owner.as_deref());
        if config.moderator_only && !requester.is_privileged() {
            return dropped(DropReason::Unauthorized);
        }
        if !requester.may_run(command) {
            return dropped(DropReason::Unauthorized);
        }

        match command {
            Command::Translate => self.cmd_translate(msg, config, &args).await,
            Command::Config => self.cmd_config(msg, config, &args),
            Command::Exclude => self.cmd_exclude(msg, config, &args, true),
            Command::Include => self.cmd_exclude(msg, config, &args, false),
            Command::GlobalIgnore => self.cmd_global_ignore(msg, config, &args),
            Command::Help => self.cmd_help(msg, config, &requester),
            Command::RefreshToken => self.cmd_refresh_token(msg).await,
        }
    }

    async fn cmd_translate(
        &self,
        msg: &ChatMessage,
        config: &ChannelConfig,
        args: &[&str],
    ) -> Result<PipelineOutcome, PipelineError> {
        let usage = format!(
            "@{}, usage: {}translate <lang> <text>",
            msg.username, config.prefix
        );
        let [lang, rest @ ..] = args else {
            return reply(usage);
        };
        let normalized = self.sanitizer.normalize(&rest.join(" "));
        if normalized.text.is_empty() {
            return reply(usage);
        }

        let source = lang.to_lowercase();
        let translation = &self.services.translation;
        match translation.translate(&normalized.text, &source).await {
            Ok(result) => reply(format_translation(
                &msg.username,
                &source,
                translation.target_lang(),
                &normalized.respliced(&result.text),
            )),
            Err(e) => reply(format!("@{}, translation failed: {e}", msg.username)),
        }
    }

    fn cmd_config(
        &self,
        msg: &ChatMessage,
        config: &ChannelConfig,
        args: &[&str],
    ) -> Result<PipelineOutcome, PipelineError> {
        let user = &msg.username;
        let Some((raw_key, value)) = args.split_first() else {
            return reply(format!(
                "@{user}, usage: {}config <key> [value]. Keys: {}",
                config.prefix,
                valid_keys()
            ));
        };
        let key = match raw_key.parse::<ConfigKey>() {
            Ok(key) => key,
            Err(e) => return reply(format!("@{user}, {e}. Valid keys: {}", valid_keys())),
        };

        if value.is_empty() {
            return reply(format!("@{user}, {key} is {}", key.current_value(config)));
        }

        let patch = match key.patch_from_value(&value.join(" ")) {
            Ok(patch) => patch,
            Err(e) => return reply(format!("@{user}, {e}")),
        };
        let updated = self.services.config.update(&msg.channel, patch)?;
        info!(channel = %msg.channel, %key, "channel config changed from chat");
        reply(format!(
            "@{user}, {key} set to {}",
            key.current_value(&updated)
        ))
    }

    fn cmd_exclude(
        &self,
        msg: &ChatMessage,
        config: &ChannelConfig,
        args: &[&str],
        exclude: bool,
    ) -> Result<PipelineOutcome, PipelineError> {
        let user = &msg.username;
        let verb = if exclude { "exclude" } else { "include" };
        let Some(target) = args.first() else {
            return reply(format!("@{user}, usage: {}{verb} <user>", config.prefix));
        };
        let target = normalize_user(target);
        let store = &self.services.config;

        let line = if exclude {
            if store.exclude_user(&msg.channel, &target)? {
                format!("@{user}, {target} will no longer be translated here.")
            } else {
                format!("@{user}, {target} is already excluded.")
            }
        } else if store.include_user(&msg.channel, &target)? {
            format!("@{user}, {target} will be translated again.")
        } else {
            format!("@{user}, {target} is not excluded.")
        };
        reply(line)
    }

    fn cmd_global_ignore(
        &self,
        msg: &ChatMessage,
        config: &ChannelConfig,
        args: &[&str],
    ) -> Result<PipelineOutcome, PipelineError> {
        let user = &msg.username;
        let ignore_list = &self.services.ignore_list;
        let usage = format!(
            "@{user}, usage: {}globalignore add|remove|list [user]",
            config.prefix
        );
        let action = args.first().map(|a| a.to_lowercase());

        match (action.as_deref(), args.get(1)) {
            (Some("add"), Some(target)) => {
                let target = normalize_user(target);
                if ignore_list.add(&target)? {
                    reply(format!("@{user}, {target} is now ignored in every channel."))
                } else {
                    reply(format!("@{user}, {target} is already ignored."))
                }
            }
            (Some("remove"), Some(target)) => {
                let target = normalize_user(target);
                if ignore_list.remove(&target)? {
                    reply(format!("@{user}, {target} is no longer ignored."))
                } else {
                    reply(format!("@{user}, {target} was not ignored."))
                }
            }
            (Some("list"), _) => {
                let names = ignore_list.list();
                if names.is_empty() {
                    return reply(format!("@{user}, the global ignore list is empty."));
                }
                Ok(PipelineOutcome::Reply(paginate_names(&names)))
            }
            _ => reply(usage),
        }
    }

    fn cmd_help(
        &self,
        msg: &ChatMessage,
        config: &ChannelConfig,
        requester: &Requester,
    ) -> Result<PipelineOutcome, PipelineError> {
        let available: Vec<String> = Command::ALL
            .into_iter()
            .filter(|c| requester.may_run(*c))
            .map(|c| format!("{}{}", config.prefix, c.name()))
            .collect();
        reply(format!(
            "@{}, commands: {}",
            msg.username,
            available.join(", ")
        ))
    }

    async fn cmd_refresh_token(&self, msg: &ChatMessage) -> Result<PipelineOutcome, PipelineError> {
        let user = &msg.username;
        let line = match self.services.credentials.refresh().await {
            Ok(_) => format!("@{user}, access token refreshed, reconnecting."),
            Err(RefreshError::Persist(_)) => {
                format!("@{user}, access token refreshed but could not be saved to disk.")
            }
            Err(e) => format!("@{user}, token refresh failed: {e}"),
        };
        reply(line)
    }
}

fn valid_keys() -> String {
    ConfigKey::ALL.map(ConfigKey::name).join(", ")
}

fn paginate_names(names: &[String]) -> Vec<String> {
    let pages = names.len().div_ceil(IGNORE_LIST_PAGE_SIZE);
    names
        .chunks(IGNORE_LIST_PAGE_SIZE)
        .enumerate()
        .map(|(i, chunk)| format!("Ignored users ({}/{pages}): {}", i + 1, chunk.join(", ")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: &str, user: &str, is_moderator: bool) -> ChatMessage {
        ChatMessage {
            channel: channel.into(),
            username: user.into(),
            text: String::new(),
            is_moderator,
        }
    }

    #[test]
    fn command_names_parse_case_insensitively() {
        assert_eq!(Command::parse("HELP"), Some(Command::Help));
        assert_eq!(Command::parse("GlobalIgnore"), Some(Command::GlobalIgnore));
        assert_eq!(Command::parse("dance"), None);
    }

    #[test]
    fn channel_owner_stands_in_for_missing_bot_owner() {
        let owner = Requester::resolve(&message("#Streamer", "streamer", false), None);
        assert!(owner.is_channel_owner);
        assert!(owner.may_run(Command::GlobalIgnore));
        assert!(owner.may_run(Command::RefreshToken));

        let with_owner = Requester::resolve(&message("#streamer", "Streamer", false), Some("admin"));
        assert!(!with_owner.may_run(Command::GlobalIgnore));
        assert!(with_owner.may_run(Command::RefreshToken));
    }

    #[test]
    fn moderators_manage_the_channel_but_not_the_bot() {
        let moderator = Requester::resolve(&message("chan", "helper", true), Some("admin"));
        assert!(moderator.may_run(Command::Config));
        assert!(moderator.may_run(Command::Exclude));
        assert!(!moderator.may_run(Command::GlobalIgnore));
        assert!(!moderator.may_run(Command::RefreshToken));

        let viewer = Requester::resolve(&message("chan", "viewer", false), Some("admin"));
        assert!(!viewer.is_privileged());
        assert!(!viewer.may_run(Command::Config));
        assert!(viewer.may_run(Command::Translate));
    }

    #[test]
    fn ignore_list_pages_hold_ten_names() {
        let names: Vec<String> = (0..23).map(|i| format!("user{i:02}")).collect();
        let pages = paginate_names(&names);
        assert_eq!(pages.len(), 3);
        assert!(pages[0].starts_with("Ignored users (1/3): user00, user01"));
        assert_eq!(pages[2], "Ignored users (3/3): user20, user21, user22");
    }
}
