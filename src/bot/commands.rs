use crate::config::CommandsConfig;

/// A recognised text command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `!paint generate|generateport|generateland <args>`
    Generate { alias: String, args: String },
    StartImage,
    StopImage,
    SetProfile(String),
    ViewProfile,
    DeleteProfile,
    /// Direct chat; carries the text after the command word
    Chat(String),
    Listen,
    StopListening,
    ClearChat,
    /// `!paint <something we don't know>`
    Unknown(String),
}

/// `text` minus `literal` when the literal is a whole leading word.
fn strip_word<'a>(text: &'a str, literal: &str) -> Option<&'a str> {
    let literal = literal.trim();
    if literal.is_empty() {
        return None;
    }
    let rest = text.strip_prefix(literal)?;
    match rest.chars().next() {
        None => Some(""),
        Some(c) if c.is_whitespace() => Some(rest.trim_start()),
        Some(_) => None,
    }
}

impl Command {
    /// `None` for ordinary conversation.
    pub fn parse(text: &str, commands: &CommandsConfig) -> Option<Self> {
        let text = text.trim();

        if let Some(rest) = strip_word(text, &commands.paint_prefix) {
            let (sub, args) = rest
                .split_once(char::is_whitespace)
                .map_or((rest, ""), |(sub, args)| (sub, args.trim()));
            return Some(match sub {
                "generate" | "generateport" | "generateland" => Self::Generate {
                    alias: sub.to_string(),
                    args: args.to_string(),
                },
                "start" => Self::StartImage,
                "stop" => Self::StopImage,
                "setprofile" => Self::SetProfile(args.to_string()),
                "viewprofile" => Self::ViewProfile,
                "deleteprofile" => Self::DeleteProfile,
                other => Self::Unknown(other.to_string()),
            });
        }

        if let Some(rest) = strip_word(text, &commands.chat) {
            return Some(Self::Chat(rest.to_string()));
        }
        if strip_word(text, &commands.listen).is_some() {
            return Some(Self::Listen);
        }
        if strip_word(text, &commands.stop).is_some() {
            return Some(Self::StopListening);
        }
        if strip_word(text, &commands.clear_chat).is_some() {
            return Some(Self::ClearChat);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Option<Command> {
        Command::parse(text, &CommandsConfig::default())
    }

    #[test]
    fn generate_aliases_keep_arguments() {
        assert_eq!(
            parse("!paint generateport --seed 5 a tower :: fog"),
            Some(Command::Generate {
                alias: "generateport".into(),
                args: "--seed 5 a tower :: fog".into(),
            })
        );
        assert_eq!(
            parse("!paint generate"),
            Some(Command::Generate {
                alias: "generate".into(),
                args: String::new(),
            })
        );
    }

    #[test]
    fn paint_subcommands() {
        assert_eq!(parse("!paint start"), Some(Command::StartImage));
        assert_eq!(parse("!paint stop"), Some(Command::StopImage));
        assert_eq!(parse("!paint viewprofile"), Some(Command::ViewProfile));
        assert_eq!(parse("!paint deleteprofile"), Some(Command::DeleteProfile));
        assert_eq!(
            parse("!paint setprofile I like foxes"),
            Some(Command::SetProfile("I like foxes".into()))
        );
        assert_eq!(parse("!paint zoom"), Some(Command::Unknown("zoom".into())));
        assert_eq!(parse("!paint"), Some(Command::Unknown(String::new())));
    }

    #[test]
    fn chat_commands() {
        assert_eq!(parse("!gemma hi there"), Some(Command::Chat("hi there".into())));
        assert_eq!(parse("!gemma"), Some(Command::Chat(String::new())));
        assert_eq!(parse("!listen"), Some(Command::Listen));
        assert_eq!(parse("!stop"), Some(Command::StopListening));
        assert_eq!(parse("!clearchat"), Some(Command::ClearChat));
    }

    #[test]
    fn lookalikes_are_conversation() {
        assert_eq!(parse("!gemmas are shiny"), None);
        assert_eq!(parse("!paintbrush"), None);
        assert_eq!(parse("!stopwatch"), None);
        assert_eq!(parse("hello gemma"), None);
    }
}
