use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use minijinja::{Environment, Error, ErrorKind};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::gotify::SourceMessage;

const TEMPLATE_NAME: &str = "message";

/// Written to disk when no template file exists yet
pub const DEFAULT_TEMPLATE: &str = "{{ Title }}\n{{ Date }}\n{{ Message }}";

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read template file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to compile template {path}: {source}")]
    Compile {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("failed to render template {path}: {source}")]
    Render {
        path: PathBuf,
        #[source]
        source: Error,
    },
}

/// The fields a template can bind to
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct MessageView<'a> {
    id: u32,
    appid: u32,
    title: &'a str,
    message: &'a str,
    priority: u32,
    date: &'a str,
    extras: Option<&'a serde_json::Value>,
}

impl<'a> From<&'a SourceMessage> for MessageView<'a> {
    fn from(msg: &'a SourceMessage) -> Self {
        Self {
            id: msg.id,
            appid: msg.appid,
            title: &msg.title,
            message: &msg.message,
            priority: msg.priority,
            date: &msg.date,
            extras: msg.extras.as_ref(),
        }
    }
}

/// Renders Gotify messages through a template file on disk.
///
/// With `reload` set the file is read and compiled again for every message,
/// so edits take effect without a restart. Otherwise the first successfully
/// compiled template is kept for the life of the renderer.
pub struct TemplateRenderer {
    path: PathBuf,
    reload: bool,
    cached: Mutex<Option<Arc<Environment<'static>>>>,
}

impl TemplateRenderer {
    pub fn new(path: impl Into<PathBuf>, reload: bool) -> Self {
        Self {
            path: path.into(),
            reload,
            cached: Mutex::new(None),
        }
    }

    /// Render a message. Never fails: on error the failure is logged and
    /// whatever was produced before it (possibly nothing) is returned.
    pub async fn render(&self, message: &SourceMessage) -> String {
        let mut buf = Vec::new();
        if let Err(e) = self.render_into(message, &mut buf).await {
            error!("Error while rendering message {}: {:#}", message.id, e);
        }
        let text = String::from_utf8_lossy(&buf).into_owned();
        debug!("Final message:\n{}", text);
        text
    }

    async fn render_into(
        &self,
        message: &SourceMessage,
        buf: &mut Vec<u8>,
    ) -> Result<(), TemplateError> {
        let env = self.environment().await?;
        let template = env
            .get_template(TEMPLATE_NAME)
            .map_err(|source| TemplateError::Compile {
                path: self.path.clone(),
                source,
            })?;

        template
            .render_to_write(MessageView::from(message), &mut *buf)
            .map_err(|source| TemplateError::Render {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }

    async fn environment(&self) -> Result<Arc<Environment<'static>>, TemplateError> {
        if !self.reload {
            if let Some(env) = self.cached.lock().await.as_ref() {
                return Ok(env.clone());
            }
        }

        debug!("Reading template file {}", self.path.display());
        let source = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| TemplateError::Read {
                path: self.path.clone(),
                source,
            })?;

        let env = Arc::new(compile(&source).map_err(|source| TemplateError::Compile {
            path: self.path.clone(),
            source,
        })?);

        if !self.reload {
            *self.cached.lock().await = Some(env.clone());
        }
        Ok(env)
    }
}

/// Compile template source into an environment with the helper set registered
pub fn compile(source: &str) -> Result<Environment<'static>, Error> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    register_helpers(&mut env);
    env.add_template_owned(TEMPLATE_NAME, normalize_go_fields(source))?;
    Ok(env)
}

fn register_helpers(env: &mut Environment<'static>) {
    // {{ Date | datefmt("%d.%m.%Y %H:%M") }}
    env.add_filter("datefmt", datefmt);
    env.add_filter("escape_markdown", escape_markdown);
    env.add_filter("truncate", truncate);
    // {{ now() }} / {{ now("%H:%M") }}
    env.add_function("now", now);
}

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_date<Tz: chrono::TimeZone>(
    date: &chrono::DateTime<Tz>,
    format: Option<&str>,
) -> Result<String, Error>
where
    Tz::Offset: std::fmt::Display,
{
    let format = format.unwrap_or(DEFAULT_DATE_FORMAT);
    let mut out = String::new();
    write!(out, "{}", date.format(format)).map_err(|_| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid date format {format:?}"),
        )
    })?;
    Ok(out)
}

fn datefmt(value: String, format: Option<String>) -> Result<String, Error> {
    let date = chrono::DateTime::parse_from_rfc3339(&value).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("cannot parse {value:?} as an RFC 3339 date: {e}"),
        )
    })?;
    format_date(&date, format.as_deref())
}

fn now(format: Option<String>) -> Result<String, Error> {
    format_date(&chrono::Local::now(), format.as_deref())
}

/// Escape the characters Telegram's legacy Markdown treats as markup
fn escape_markdown(value: String) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn truncate(value: String, length: usize) -> String {
    if value.chars().count() <= length {
        return value;
    }
    let mut out: String = value.chars().take(length).collect();
    out.push_str("...");
    out
}

/// Rewrite Go-template field references (`{{ .Title }}`) into plain names so
/// templates written for the Go text/template syntax keep working.
fn normalize_go_fields(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    loop {
        let open = match (rest.find("{{"), rest.find("{%")) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => break,
        };
        let close_marker = if rest[open..].starts_with("{{") { "}}" } else { "%}" };

        out.push_str(&rest[..open]);
        match rest[open + 2..].find(close_marker) {
            Some(len) => {
                let end = open + 2 + len + close_marker.len();
                out.push_str(&strip_field_dots(&rest[open..end]));
                rest = &rest[end..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
                break;
            }
        }
    }

    out.push_str(rest);
    out
}

fn strip_field_dots(tag: &str) -> String {
    let mut out = String::with_capacity(tag.len());
    let mut prev: Option<char> = None;
    let mut quote: Option<char> = None;
    let mut chars = tag.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q && prev != Some('\\') {
                    quote = None;
                }
            }
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '.' => {
                let after_value =
                    prev.is_some_and(|p| p.is_alphanumeric() || matches!(p, '_' | ')' | ']'));
                let before_name = chars.peek().is_some_and(|n| n.is_alphabetic() || *n == '_');
                if !after_value && before_name {
                    prev = Some(c);
                    continue;
                }
            }
            None => {}
        }
        out.push(c);
        prev = Some(c);
    }

    out
}
