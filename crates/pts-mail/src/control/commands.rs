//! # Control Command Grammar
//!
//! One command per mail body line. Each registered command carries an
//! ordered regex list; the factory tries commands in registration order and
//! the first matching regex wins. Verbs match case-insensitively, arguments
//! are captured verbatim.

use std::fmt;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use pts_shared::models::Keyword;

/// How a keyword command changes a subscription's allowed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordOperator {
    /// `=`: replace the set.
    Set,
    /// `+`: add to the set.
    Add,
    /// `-`: remove from the set.
    Remove,
}

impl fmt::Display for KeywordOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeywordOperator::Set => "=",
            KeywordOperator::Add => "+",
            KeywordOperator::Remove => "-",
        })
    }
}

/// A successfully parsed command line. Optional emails default to the
/// sender at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCommand {
    Subscribe {
        package: String,
        email: Option<String>,
    },
    Unsubscribe {
        package: String,
        email: Option<String>,
    },
    UnsubscribeAll {
        email: Option<String>,
    },
    Which {
        email: Option<String>,
    },
    Who {
        package: String,
    },
    ViewKeywords {
        package: String,
        email: Option<String>,
    },
    ChangeKeywords {
        package: String,
        email: Option<String>,
        operator: KeywordOperator,
        keywords: Vec<Keyword>,
    },
    JoinTeam {
        team_slug: String,
        email: Option<String>,
    },
    LeaveTeam {
        team_slug: String,
        email: Option<String>,
    },
    Confirm {
        token: String,
    },
    Help,
    Quit,
}

impl ParsedCommand {
    /// The canonical echo form with the acting email resolved, used as the
    /// re-executable text bound to a confirmation token.
    pub fn canonical_text(&self, resolved_email: &str) -> String {
        match self {
            ParsedCommand::Subscribe { package, .. } => {
                format!("subscribe {package} {resolved_email}")
            }
            ParsedCommand::Unsubscribe { package, .. } => {
                format!("unsubscribe {package} {resolved_email}")
            }
            ParsedCommand::UnsubscribeAll { .. } => format!("unsubscribe-all {resolved_email}"),
            ParsedCommand::Which { .. } => format!("which {resolved_email}"),
            ParsedCommand::Who { package } => format!("who {package}"),
            ParsedCommand::ViewKeywords { package, .. } => {
                format!("keyword {package} {resolved_email}")
            }
            ParsedCommand::ChangeKeywords {
                package,
                operator,
                keywords,
                ..
            } => {
                let list: Vec<&str> = keywords.iter().map(Keyword::as_str).collect();
                format!(
                    "keyword {package} {resolved_email} {operator} {}",
                    list.join(" ")
                )
            }
            ParsedCommand::JoinTeam { team_slug, .. } => {
                format!("join-team {team_slug} {resolved_email}")
            }
            ParsedCommand::LeaveTeam { team_slug, .. } => {
                format!("leave-team {team_slug} {resolved_email}")
            }
            ParsedCommand::Confirm { token } => format!("confirm {token}"),
            ParsedCommand::Help => "help".to_string(),
            ParsedCommand::Quit => "quit".to_string(),
        }
    }
}

type BuildFn = fn(&Captures) -> ParsedCommand;

/// A registered command: name, help text, ordered regex list and the
/// confirmation requirement.
pub struct CommandDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub needs_confirmation: bool,
    regexes: Vec<(Regex, BuildFn)>,
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("needs_confirmation", &self.needs_confirmation)
            .finish_non_exhaustive()
    }
}

/// Matches command lines against the registered command table.
#[derive(Debug)]
pub struct CommandFactory {
    descriptors: Vec<CommandDescriptor>,
}

static OPTIONAL_EMAIL: &str = r"(?:\s+(?P<email>\S+@\S+))?";

impl Default for CommandFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandFactory {
    pub fn new() -> Self {
        let descriptors = vec![
            descriptor(
                "subscribe",
                "subscribe <package> [<email>]\n  Subscribes <email> to all messages regarding <package>.",
                true,
                vec![(
                    format!(r"^(?i:subscribe)\s+(?P<package>\S+){OPTIONAL_EMAIL}$"),
                    build_subscribe as BuildFn,
                )],
            ),
            descriptor(
                "unsubscribe-all",
                "unsubscribe-all [<email>]\n  Cancels all subscriptions of <email>.",
                true,
                vec![(
                    format!(r"^(?i:unsubscribe-all){OPTIONAL_EMAIL}$"),
                    build_unsubscribe_all as BuildFn,
                )],
            ),
            descriptor(
                "unsubscribe",
                "unsubscribe <package> [<email>]\n  Unsubscribes <email> from <package>.",
                false,
                vec![(
                    format!(r"^(?i:unsubscribe)\s+(?P<package>\S+){OPTIONAL_EMAIL}$"),
                    build_unsubscribe as BuildFn,
                )],
            ),
            descriptor(
                "which",
                "which [<email>]\n  Lists the packages <email> is subscribed to.",
                false,
                vec![(
                    format!(r"^(?i:which){OPTIONAL_EMAIL}$"),
                    build_which as BuildFn,
                )],
            ),
            descriptor(
                "who",
                "who <package>\n  Lists the subscribers of <package>.",
                false,
                vec![(
                    r"^(?i:who)\s+(?P<package>\S+)$".to_string(),
                    build_who as BuildFn,
                )],
            ),
            descriptor(
                "keyword",
                "keyword <package> [<email>] [{+|-|=} <keyword>...]\n  Shows or changes the accepted keywords of one subscription.",
                false,
                vec![
                    (
                        format!(
                            r"^(?i:keywords?)\s+(?P<package>\S+){OPTIONAL_EMAIL}\s*(?P<op>[+=-])\s+(?P<keywords>.+)$"
                        ),
                        build_change_keywords as BuildFn,
                    ),
                    (
                        format!(r"^(?i:keywords?)\s+(?P<package>\S+){OPTIONAL_EMAIL}$"),
                        build_view_keywords as BuildFn,
                    ),
                ],
            ),
            descriptor(
                "join-team",
                "join-team <team-slug> [<email>]\n  Adds <email> to the public team with the given slug.",
                true,
                vec![(
                    format!(r"^(?i:join-team)\s+(?P<team>\S+){OPTIONAL_EMAIL}$"),
                    build_join_team as BuildFn,
                )],
            ),
            descriptor(
                "leave-team",
                "leave-team <team-slug> [<email>]\n  Removes <email> from the team with the given slug.",
                false,
                vec![(
                    format!(r"^(?i:leave-team)\s+(?P<team>\S+){OPTIONAL_EMAIL}$"),
                    build_leave_team as BuildFn,
                )],
            ),
            descriptor(
                "confirm",
                "confirm <token>\n  Confirms a previously requested command.",
                false,
                vec![(
                    r"^(?i:confirm)\s+(?P<token>\S+)$".to_string(),
                    build_confirm as BuildFn,
                )],
            ),
            descriptor(
                "help",
                "help\n  Shows all available commands.",
                false,
                vec![(r"^(?i:help)$".to_string(), build_help as BuildFn)],
            ),
            descriptor(
                "quit",
                "quit\n  Stops processing commands.",
                false,
                vec![(
                    r"^(?i:(?:quit|thanks|stop|exit)|--)$".to_string(),
                    build_quit as BuildFn,
                )],
            ),
        ];
        Self { descriptors }
    }

    /// Match one line. The first matching regex of the first matching
    /// command wins.
    pub fn parse_line(&self, line: &str) -> Option<(ParsedCommand, &CommandDescriptor)> {
        for descriptor in &self.descriptors {
            for (regex, build) in &descriptor.regexes {
                if let Some(captures) = regex.captures(line) {
                    return Some((build(&captures), descriptor));
                }
            }
        }
        None
    }

    /// Command descriptors in registration order, for `help`.
    pub fn descriptors(&self) -> impl Iterator<Item = &CommandDescriptor> {
        self.descriptors.iter()
    }
}

fn descriptor(
    name: &'static str,
    description: &'static str,
    needs_confirmation: bool,
    patterns: Vec<(String, BuildFn)>,
) -> CommandDescriptor {
    CommandDescriptor {
        name,
        description,
        needs_confirmation,
        regexes: patterns
            .into_iter()
            .map(|(pattern, build)| {
                (
                    Regex::new(&pattern).expect("static command regex"),
                    build,
                )
            })
            .collect(),
    }
}

fn capture(captures: &Captures, name: &str) -> Option<String> {
    captures.name(name).map(|m| m.as_str().to_string())
}

fn build_subscribe(captures: &Captures) -> ParsedCommand {
    ParsedCommand::Subscribe {
        package: captures["package"].to_string(),
        email: capture(captures, "email"),
    }
}

fn build_unsubscribe(captures: &Captures) -> ParsedCommand {
    ParsedCommand::Unsubscribe {
        package: captures["package"].to_string(),
        email: capture(captures, "email"),
    }
}

fn build_unsubscribe_all(captures: &Captures) -> ParsedCommand {
    ParsedCommand::UnsubscribeAll {
        email: capture(captures, "email"),
    }
}

fn build_which(captures: &Captures) -> ParsedCommand {
    ParsedCommand::Which {
        email: capture(captures, "email"),
    }
}

fn build_who(captures: &Captures) -> ParsedCommand {
    ParsedCommand::Who {
        package: captures["package"].to_string(),
    }
}

fn build_view_keywords(captures: &Captures) -> ParsedCommand {
    ParsedCommand::ViewKeywords {
        package: captures["package"].to_string(),
        email: capture(captures, "email"),
    }
}

fn build_change_keywords(captures: &Captures) -> ParsedCommand {
    let operator = match &captures["op"] {
        "+" => KeywordOperator::Add,
        "-" => KeywordOperator::Remove,
        _ => KeywordOperator::Set,
    };
    let keywords = captures["keywords"]
        .split_whitespace()
        .map(Keyword::from)
        .collect();
    ParsedCommand::ChangeKeywords {
        package: captures["package"].to_string(),
        email: capture(captures, "email"),
        operator,
        keywords,
    }
}

fn build_join_team(captures: &Captures) -> ParsedCommand {
    ParsedCommand::JoinTeam {
        team_slug: captures["team"].to_string(),
        email: capture(captures, "email"),
    }
}

fn build_leave_team(captures: &Captures) -> ParsedCommand {
    ParsedCommand::LeaveTeam {
        team_slug: captures["team"].to_string(),
        email: capture(captures, "email"),
    }
}

fn build_confirm(captures: &Captures) -> ParsedCommand {
    ParsedCommand::Confirm {
        token: captures["token"].to_string(),
    }
}

fn build_help(_captures: &Captures) -> ParsedCommand {
    ParsedCommand::Help
}

fn build_quit(_captures: &Captures) -> ParsedCommand {
    ParsedCommand::Quit
}

/// The process-wide factory; the table is immutable after first use.
pub fn factory() -> &'static CommandFactory {
    static FACTORY: Lazy<CommandFactory> = Lazy::new(CommandFactory::new);
    &FACTORY
}
