//! # Control Command Processor
//!
//! Drives one inbound control mail end-to-end: loop guard, plain-text
//! extraction, per-line command matching with an error budget, two-phase
//! confirmation, and a single reply carrying the transcript. User-visible
//! failures are transcript lines; nothing propagates to the MTA.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, instrument};

use pts_shared::models::{normalize_email, CommandConfirmation, Keyword};
use pts_shared::storage::{Storage, SubscribeOutcome};
use pts_shared::transport::{MailTransport, OutboundMessage};
use pts_shared::{PtsConfig, PtsResult};

use crate::codec::{message, MailMessage};

use super::commands::{factory, KeywordOperator, ParsedCommand};

/// Processing halts when this many lines failed to match any command.
pub const MAX_ALLOWED_ERRORS: usize = 5;

const PLAIN_TEXT_WARNING: &str = "\
Your message could not be processed because it did not contain a\n\
decodable text/plain part. Please resend your commands as plain text.";

/// What happened to one inbound control mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Our own loop address was present; dropped silently.
    LoopDropped,
    /// No plain-text part (or sender unknown); a templated warning went out.
    WarningSent,
    /// Zero commands matched, so no reply was produced.
    Ignored,
    Replied {
        processed: usize,
    },
}

#[derive(Debug)]
pub struct ControlProcessor {
    config: PtsConfig,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn MailTransport>,
}

impl ControlProcessor {
    pub fn new(
        config: PtsConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            config,
            storage,
            transport,
        }
    }

    /// Process one control mail.
    #[instrument(skip(self, raw))]
    pub async fn process(&self, raw: &[u8]) -> PtsResult<ControlOutcome> {
        let msg = MailMessage::parse(raw.to_vec())?;

        if msg
            .header_all("X-Loop")
            .iter()
            .any(|value| *value == self.config.control_email)
        {
            info!("Control mail carries our own loop address, dropped");
            return Ok(ControlOutcome::LoopDropped);
        }

        let from_email = match msg.from_address() {
            Some(address) => normalize_email(&address),
            None => {
                info!("Control mail without a From address, dropped");
                return Ok(ControlOutcome::Ignored);
            }
        };

        let text = match msg.first_plain_text() {
            Some(text) => text,
            None => {
                self.send_reply(&msg, &from_email, PLAIN_TEXT_WARNING)
                    .await?;
                return Ok(ControlOutcome::WarningSent);
            }
        };

        let mut transcript: Vec<String> = Vec::new();
        let mut errors = 0;
        let mut processed = 0;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            transcript.push(format!("> {line}"));

            match factory().parse_line(line) {
                None => {
                    errors += 1;
                    if errors == MAX_ALLOWED_ERRORS {
                        break;
                    }
                }
                Some((command, descriptor)) => {
                    let is_quit = matches!(command, ParsedCommand::Quit);
                    let lines = self
                        .execute(command, descriptor.needs_confirmation, &from_email)
                        .await?;
                    transcript.extend(lines);
                    processed += 1;
                    if is_quit {
                        break;
                    }
                }
            }
        }

        if processed == 0 {
            // Pure-garbage mails are ignored to prevent amplification.
            return Ok(ControlOutcome::Ignored);
        }

        self.send_reply(&msg, &from_email, &transcript.join("\n"))
            .await?;
        Ok(ControlOutcome::Replied { processed })
    }

    /// Execute one parsed command. Commands requiring confirmation run
    /// their validation phase and enqueue a token instead of taking effect.
    async fn execute(
        &self,
        command: ParsedCommand,
        needs_confirmation: bool,
        from_email: &str,
    ) -> PtsResult<Vec<String>> {
        if needs_confirmation {
            return self.pre_confirm(command, from_email).await;
        }
        match command {
            ParsedCommand::Confirm { token } => self.handle_confirm(&token).await,
            other => self.handle(other, from_email).await,
        }
    }

    /// Phase one of a confirmed command: validate preconditions, bind a
    /// one-time token to the resolved command text, and mail it out.
    async fn pre_confirm(
        &self,
        command: ParsedCommand,
        from_email: &str,
    ) -> PtsResult<Vec<String>> {
        let email = acting_email(&command, from_email);

        let precondition = match &command {
            ParsedCommand::Subscribe { package, .. } => {
                self.check_subscribe(package, &email).await?
            }
            ParsedCommand::JoinTeam { team_slug, .. } => {
                self.check_join_team(team_slug, &email).await?
            }
            ParsedCommand::UnsubscribeAll { .. } => self.check_unsubscribe_all(&email).await?,
            // Only the commands above are flagged as needing confirmation.
            _ => Ok(()),
        };
        if let Err(lines) = precondition {
            return Ok(lines);
        }

        let confirmation = CommandConfirmation::new(&command.canonical_text(&email), from_email);
        let token = confirmation.token.clone();
        let command_text = confirmation.command.clone();
        self.storage.store_confirmation(confirmation).await?;
        self.send_confirmation_mail(&email, &token, &command_text)
            .await?;
        Ok(vec![format!("A confirmation mail has been sent to {email}")])
    }

    /// Phase two: claim the token and run the bound command for real.
    async fn handle_confirm(&self, token: &str) -> PtsResult<Vec<String>> {
        let confirmation = match self.storage.claim_confirmation(token).await? {
            Some(confirmation) => confirmation,
            None => return Ok(vec!["Error: unknown confirmation token.".to_string()]),
        };

        let ttl = ChronoDuration::hours(self.config.confirmation_ttl_hours);
        if Utc::now() - confirmation.created_at > ttl {
            return Ok(vec!["Error: the confirmation token has expired.".to_string()]);
        }

        let (command, _) = match factory().parse_line(&confirmation.command) {
            Some(parsed) => parsed,
            None => {
                return Ok(vec![
                    "Error: the confirmed command is no longer recognized.".to_string(),
                ])
            }
        };
        let mut lines = vec![format!("Confirmed: {}", confirmation.command)];
        lines.extend(self.handle(command, &confirmation.requester).await?);
        Ok(lines)
    }

    /// The side-effect phase shared by direct and confirmed execution.
    async fn handle(&self, command: ParsedCommand, from_email: &str) -> PtsResult<Vec<String>> {
        let email = acting_email(&command, from_email);
        match command {
            ParsedCommand::Subscribe { package, .. } => {
                if let Err(lines) = self.check_subscribe(&package, &email).await? {
                    return Ok(lines);
                }
                // The unique-constraint fallback: a conflicting insert
                // degrades to an idempotent warning.
                match self.storage.subscribe(&package, &email).await? {
                    SubscribeOutcome::Subscribed => {
                        Ok(vec![format!("{email} has been subscribed to {package}")])
                    }
                    SubscribeOutcome::AlreadySubscribed => Ok(vec![format!(
                        "Warning: {email} is already subscribed to {package}"
                    )]),
                }
            }
            ParsedCommand::Unsubscribe { package, .. } => {
                if self.storage.unsubscribe(&package, &email).await? {
                    Ok(vec![format!(
                        "{email} has been unsubscribed from {package}"
                    )])
                } else {
                    Ok(vec![format!(
                        "Warning: {email} is not subscribed to {package}"
                    )])
                }
            }
            ParsedCommand::UnsubscribeAll { .. } => {
                let packages = self.storage.unsubscribe_all(&email).await?;
                if packages.is_empty() {
                    return Ok(vec![format!(
                        "Email {email} is not subscribed to any packages."
                    )]);
                }
                Ok(packages
                    .iter()
                    .map(|package| format!("Unsubscribing {email} from {package}"))
                    .collect())
            }
            ParsedCommand::Which { .. } => {
                let subscriptions = self.storage.subscriptions_for_user(&email).await?;
                let active: Vec<String> = subscriptions
                    .into_iter()
                    .filter(|subscription| subscription.active)
                    .map(|subscription| format!("* {}", subscription.package))
                    .collect();
                if active.is_empty() {
                    Ok(vec!["No subscriptions!".to_string()])
                } else {
                    Ok(active)
                }
            }
            ParsedCommand::Who { package } => {
                if self.storage.get_package(&package).await?.is_none() {
                    return Ok(vec![format!("Error: package {package} does not exist.")]);
                }
                let subscribers: Vec<String> = self
                    .storage
                    .subscriptions_for_package(&package)
                    .await?
                    .into_iter()
                    .filter(|subscription| subscription.active)
                    .map(|subscription| obfuscate(&subscription.email))
                    .collect();
                if subscribers.is_empty() {
                    Ok(vec![format!("Package {package} has no subscribers.")])
                } else {
                    Ok(vec![format!(
                        "Subscribers of {package}: {}",
                        subscribers.join(", ")
                    )])
                }
            }
            ParsedCommand::ViewKeywords { package, .. } => {
                match self.storage.get_subscription(&package, &email).await? {
                    Some(subscription) => Ok(vec![keyword_listing(&package, &email, &subscription.keywords)]),
                    None => Ok(vec![format!(
                        "Warning: {email} is not subscribed to {package}"
                    )]),
                }
            }
            ParsedCommand::ChangeKeywords {
                package,
                operator,
                keywords,
                ..
            } => {
                let subscription = match self.storage.get_subscription(&package, &email).await? {
                    Some(subscription) => subscription,
                    None => {
                        return Ok(vec![format!(
                            "Warning: {email} is not subscribed to {package}"
                        )])
                    }
                };
                let mut set = subscription.keywords;
                match operator {
                    KeywordOperator::Set => {
                        set = keywords.into_iter().collect();
                    }
                    KeywordOperator::Add => {
                        set.extend(keywords);
                    }
                    KeywordOperator::Remove => {
                        for keyword in &keywords {
                            set.remove(keyword);
                        }
                    }
                }
                self.storage
                    .set_keywords(&package, &email, set.clone())
                    .await?;
                Ok(vec![keyword_listing(&package, &email, &set)])
            }
            ParsedCommand::JoinTeam { team_slug, .. } => {
                if let Err(lines) = self.check_join_team(&team_slug, &email).await? {
                    return Ok(lines);
                }
                self.storage.add_team_member(&team_slug, &email).await?;
                Ok(vec![format!(
                    "You have successfully joined the team \"{team_slug}\""
                )])
            }
            ParsedCommand::LeaveTeam { team_slug, .. } => {
                if self.storage.get_team(&team_slug).await?.is_none() {
                    return Ok(vec![format!(
                        "Error: team with the slug \"{team_slug}\" does not exist."
                    )]);
                }
                if self.storage.remove_team_member(&team_slug, &email).await? {
                    Ok(vec![format!(
                        "You have been removed from the team \"{team_slug}\""
                    )])
                } else {
                    Ok(vec!["Warning: you are not a member of the team.".to_string()])
                }
            }
            ParsedCommand::Help => {
                let mut lines = vec!["Available commands:".to_string()];
                for descriptor in factory().descriptors() {
                    lines.push(format!("  {}", descriptor.description.replace('\n', "\n  ")));
                }
                Ok(lines)
            }
            ParsedCommand::Quit => Ok(vec!["Stopping processing here.".to_string()]),
            ParsedCommand::Confirm { .. } => {
                // Reached only through handle_confirm; a confirm bound to a
                // confirm is never stored.
                Ok(Vec::new())
            }
        }
    }

    /// Subscribe preconditions: known package, not already subscribed.
    async fn check_subscribe(
        &self,
        package: &str,
        email: &str,
    ) -> PtsResult<Result<(), Vec<String>>> {
        if self.storage.get_package(package).await?.is_none() {
            return Ok(Err(vec![format!(
                "Error: package {package} does not exist."
            )]));
        }
        if let Some(subscription) = self.storage.get_subscription(package, email).await? {
            if subscription.active {
                return Ok(Err(vec![format!(
                    "Warning: {email} is already subscribed to {package}"
                )]));
            }
        }
        Ok(Ok(()))
    }

    /// Join-team preconditions: team exists, is public, user not a member.
    async fn check_join_team(
        &self,
        team_slug: &str,
        email: &str,
    ) -> PtsResult<Result<(), Vec<String>>> {
        let team = match self.storage.get_team(team_slug).await? {
            Some(team) => team,
            None => {
                return Ok(Err(vec![format!(
                    "Error: team with the slug \"{team_slug}\" does not exist."
                )]))
            }
        };
        if !team.public {
            return Ok(Err(vec![format!(
                "Error: the given team is not public. Please contact {} if you wish to join",
                team.owner_email
            )]));
        }
        if team.members.contains(email) {
            return Ok(Err(vec![
                "Warning: you are already a member of the team.".to_string(),
            ]));
        }
        Ok(Ok(()))
    }

    async fn check_unsubscribe_all(&self, email: &str) -> PtsResult<Result<(), Vec<String>>> {
        let subscriptions = self.storage.subscriptions_for_user(email).await?;
        if subscriptions.is_empty() {
            return Ok(Err(vec![format!(
                "Email {email} is not subscribed to any packages."
            )]));
        }
        Ok(Ok(()))
    }

    /// One reply per inbound mail, with our loop address set.
    async fn send_reply(&self, msg: &MailMessage, to: &str, body: &str) -> PtsResult<()> {
        let subject = format!(
            "Re: {}",
            msg.subject().unwrap_or_else(|| "Your mail".to_string())
        );
        let data = message::compose(
            &[
                ("From", &self.config.contact_email),
                ("To", to),
                ("Subject", &subject),
                ("X-Loop", &self.config.control_email),
            ],
            body,
        )?;
        self.transport
            .send(OutboundMessage::new(&self.config.contact_email, to, data))
            .await
    }

    async fn send_confirmation_mail(
        &self,
        to: &str,
        token: &str,
        command_text: &str,
    ) -> PtsResult<()> {
        let body = format!(
            "Someone (maybe you) requested the following command:\n\n\
             > {command_text}\n\n\
             To go through with it, mail {} the single line:\n\n\
             confirm {token}\n\n\
             The token is valid for {} hours and can be used once.",
            self.config.control_email, self.config.confirmation_ttl_hours
        );
        let data = message::compose(
            &[
                ("From", &self.config.contact_email),
                ("To", to),
                ("Subject", &format!("CONFIRM {token}")),
                ("X-Loop", &self.config.control_email),
            ],
            &body,
        )?;
        self.transport
            .send(OutboundMessage::new(&self.config.contact_email, to, data))
            .await
    }
}

/// The email a command acts for: its explicit argument, else the sender.
fn acting_email(command: &ParsedCommand, from_email: &str) -> String {
    let explicit = match command {
        ParsedCommand::Subscribe { email, .. }
        | ParsedCommand::Unsubscribe { email, .. }
        | ParsedCommand::UnsubscribeAll { email }
        | ParsedCommand::Which { email }
        | ParsedCommand::ViewKeywords { email, .. }
        | ParsedCommand::ChangeKeywords { email, .. }
        | ParsedCommand::JoinTeam { email, .. }
        | ParsedCommand::LeaveTeam { email, .. } => email.as_deref(),
        _ => None,
    };
    normalize_email(explicit.unwrap_or(from_email))
}

/// Hide the domain when listing subscribers to third parties.
fn obfuscate(email: &str) -> String {
    match email.split_once('@') {
        Some((local, _)) => format!("{local}@..."),
        None => email.to_string(),
    }
}

fn keyword_listing(
    package: &str,
    email: &str,
    keywords: &std::collections::BTreeSet<Keyword>,
) -> String {
    let list: Vec<&str> = keywords.iter().map(Keyword::as_str).collect();
    format!(
        "Keywords for {email} on {package}: {}",
        list.join(", ")
    )
}
