// prompt.rs — system/user prompt templates per reading action
use crate::chat::conversation::{ChatTurn, Role};

pub const UNKNOWN_BOOK: &str   = "Unknown book";
pub const UNKNOWN_AUTHOR: &str = "Unknown author";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Explain,
    Digest,
    Analyze,
    Chat,
}

impl Action {
    /// Unknown actions are treated as free chat.
    pub fn parse(s: &str) -> Action {
        match s {
            "explain" => Action::Explain,
            "digest"  => Action::Digest,
            "analyze" => Action::Analyze,
            _         => Action::Chat,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Explain => "explain",
            Action::Digest  => "digest",
            Action::Analyze => "analyze",
            Action::Chat    => "chat",
        }
    }

    fn system_template(&self) -> &'static str {
        match self {
            Action::Explain => "You are a reading assistant who knows \"{book}\" by {author} well. \
                Explain concepts and terms in plain language, keep it concise, and add background \
                where it helps.",
            Action::Digest  => "You are a reading assistant who knows \"{book}\" by {author} well. \
                Distil the core ideas of a passage, place them in their school of thought and \
                historical development, and keep the result both rigorous and easy to follow.",
            Action::Analyze => "You are an objective analyst who knows \"{book}\" by {author} well. \
                Examine claims from several angles, give arguments for and against, cite relevant \
                scholars or research, and suggest further reading.",
            Action::Chat    => "You are a reading assistant who knows \"{book}\" by {author} well. \
                Answer clearly and concisely, adding background where it helps.",
        }
    }

    fn user_template(&self) -> &'static str {
        match self {
            Action::Explain => "I am reading \"{book}\" by {author} and don't understand \"{text}\". \
                Please explain it in plain language.",
            Action::Digest  => "I am reading \"{book}\" by {author} and find this passage hard. Help me \
                digest it, covering the core ideas, school of thought and historical development:\n\n{text}",
            Action::Analyze => "I am reading \"{book}\" by {author} and have doubts about this claim. \
                Analyse it from several angles, with arguments for and against and references to \
                relevant scholars or research:\n\n{text}",
            Action::Chat    => "Here is our conversation so far\n{context}\n\nContinue from it and \
                answer my question:\n{text}",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    pub system: String,
    pub user:   String,
}

/// Substitute `{name}` placeholders in one pass, so substituted text is never
/// re-scanned for placeholders.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let hit = values.iter().find(|(name, _)| {
            tail.len() > name.len() + 1
                && tail[1..].starts_with(name)
                && tail[1 + name.len()..].starts_with('}')
        });
        match hit {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len() + 2..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Prior turns rendered as `I asked: ...` / `AI answered: ...` lines.
pub fn render_context(context: &[ChatTurn]) -> String {
    context
        .iter()
        .map(|turn| match turn.role {
            Role::User      => format!("I asked: {}", turn.content),
            Role::Assistant => format!("AI answered: {}", turn.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompts(
    action:  &str,
    text:    &str,
    book:    Option<&str>,
    author:  Option<&str>,
    context: &[ChatTurn],
) -> Prompts {
    let action = Action::parse(action);
    let book = book.map(str::trim).filter(|b| !b.is_empty()).unwrap_or(UNKNOWN_BOOK);
    let author = author.map(str::trim).filter(|a| !a.is_empty()).unwrap_or(UNKNOWN_AUTHOR);
    let context = render_context(context);

    let values = [("book", book), ("author", author), ("text", text), ("context", context.as_str())];
    Prompts {
        system: fill(action.system_template(), &values),
        user:   fill(action.user_template(), &values),
    }
}

/// Minimal exchange used to validate a key/model combination.
pub fn connection_test_prompts() -> Prompts {
    Prompts {
        system: "You are a connectivity check. Reply with the single word OK.".to_string(),
        user:   "Reply with OK.".to_string(),
    }
}
