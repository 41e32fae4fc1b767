//! Channel identifiers and the operations a worker accepts.

use super::error::{WorkerError, WorkerResult};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Opaque, stable identifier of a conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Element state awaited by [`Operation::WaitFor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitState {
    /// Present and displayed.
    #[default]
    Visible,
    /// Absent or not displayed.
    Hidden,
    /// Present in the DOM.
    Attached,
    /// Absent from the DOM.
    Detached,
}

impl WaitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Visible => "visible",
            Self::Hidden => "hidden",
            Self::Attached => "attached",
            Self::Detached => "detached",
        }
    }
}

impl FromStr for WaitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "visible" => Ok(Self::Visible),
            "hidden" => Ok(Self::Hidden),
            "attached" => Ok(Self::Attached),
            "detached" => Ok(Self::Detached),
            other => Err(format!(
                "unknown state '{}' (expected visible, hidden, attached or detached)",
                other
            )),
        }
    }
}

impl fmt::Display for WaitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed automation command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Navigate { url: String },
    Click { selector: String },
    Fill { selector: String, text: String },
    Upload { selector: String, path: PathBuf },
    WaitFor { selector: String, state: WaitState },
    /// `None` writes to the worker's screenshot directory.
    Screenshot { path: Option<PathBuf> },
    HealthCheck,
}

impl Operation {
    /// Parse an operation name (aliases included) and its arguments.
    ///
    /// | Name(s)                             | Arguments                  |
    /// |-------------------------------------|----------------------------|
    /// | `navigate`, `goto`                  | url                        |
    /// | `click`                             | selector                   |
    /// | `fill`                              | selector, text             |
    /// | `upload`                            | selector, path             |
    /// | `wait_for`, `wait-for`              | selector, \[state\]        |
    /// | `screenshot`, `capture-screenshot`  | \[path\]                   |
    /// | `health_check`, `health-check`      |                            |
    ///
    /// # Errors
    ///
    /// [`WorkerError::UnknownOperation`] for an unsupported name,
    /// [`WorkerError::InvalidArguments`] for a wrong argument count or state.
    pub fn parse(name: &str, args: &[String]) -> WorkerResult<Self> {
        let op = match name {
            "navigate" | "goto" => {
                let [url] = exactly::<1>("navigate", args)?;
                Self::Navigate { url }
            }
            "click" => {
                let [selector] = exactly::<1>("click", args)?;
                Self::Click { selector }
            }
            "fill" => {
                let [selector, text] = exactly::<2>("fill", args)?;
                Self::Fill { selector, text }
            }
            "upload" => {
                let [selector, path] = exactly::<2>("upload", args)?;
                Self::Upload {
                    selector,
                    path: PathBuf::from(path),
                }
            }
            "wait_for" | "wait-for" => match args {
                [selector] => Self::WaitFor {
                    selector: selector.clone(),
                    state: WaitState::default(),
                },
                [selector, state] => Self::WaitFor {
                    selector: selector.clone(),
                    state: state.parse().map_err(|message| invalid("wait_for", message))?,
                },
                _ => return Err(invalid("wait_for", arity_message("1 or 2", args.len()))),
            },
            "screenshot" | "capture-screenshot" => match args {
                [] => Self::Screenshot { path: None },
                [path] => Self::Screenshot {
                    path: Some(PathBuf::from(path)),
                },
                _ => return Err(invalid("screenshot", arity_message("0 or 1", args.len()))),
            },
            "health_check" | "health-check" => {
                exactly::<0>("health_check", args)?;
                Self::HealthCheck
            }
            other => return Err(WorkerError::UnknownOperation(other.to_string())),
        };
        Ok(op)
    }

    /// Canonical operation name, used for logging and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Fill { .. } => "fill",
            Self::Upload { .. } => "upload",
            Self::WaitFor { .. } => "wait_for",
            Self::Screenshot { .. } => "screenshot",
            Self::HealthCheck => "health_check",
        }
    }
}

fn exactly<const N: usize>(operation: &str, args: &[String]) -> WorkerResult<[String; N]> {
    <[String; N]>::try_from(args.to_vec())
        .map_err(|_| invalid(operation, arity_message(&N.to_string(), args.len())))
}

fn arity_message(expected: &str, got: usize) -> String {
    format!("expected {} argument(s), got {}", expected, got)
}

fn invalid(operation: &str, message: String) -> WorkerError {
    WorkerError::InvalidArguments {
        operation: operation.to_string(),
        message,
    }
}

/// What a successful command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Completed,
    /// Path of the written screenshot.
    Screenshot(PathBuf),
    /// Health check passed; `recreated` if the session had to be replaced.
    Healthy { recreated: bool },
}

impl fmt::Display for OperationOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("ok"),
            Self::Screenshot(path) => write!(f, "screenshot saved to {}", path.display()),
            Self::Healthy { recreated: false } => f.write_str("healthy"),
            Self::Healthy { recreated: true } => f.write_str("healthy (session recreated)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_parse_aliases() {
        let url = args(&["https://example.com"]);
        assert_eq!(
            Operation::parse("goto", &url).unwrap(),
            Operation::parse("navigate", &url).unwrap()
        );
        assert_eq!(
            Operation::parse("wait-for", &args(&["#x"])).unwrap(),
            Operation::parse("wait_for", &args(&["#x"])).unwrap()
        );
        assert_eq!(
            Operation::parse("capture-screenshot", &[]).unwrap(),
            Operation::Screenshot { path: None }
        );
        assert_eq!(Operation::parse("health-check", &[]).unwrap(), Operation::HealthCheck);
    }

    #[test]
    fn test_parse_fill_and_upload() {
        assert_eq!(
            Operation::parse("fill", &args(&["#name", "tank"])).unwrap(),
            Operation::Fill {
                selector: "#name".into(),
                text: "tank".into()
            }
        );
        assert_eq!(
            Operation::parse("upload", &args(&["input[type=file]", "/tmp/a.png"])).unwrap(),
            Operation::Upload {
                selector: "input[type=file]".into(),
                path: PathBuf::from("/tmp/a.png")
            }
        );
    }

    #[test]
    fn test_parse_wait_state() {
        let op = Operation::parse("wait_for", &args(&["#lobby", "Detached"])).unwrap();
        assert_eq!(
            op,
            Operation::WaitFor {
                selector: "#lobby".into(),
                state: WaitState::Detached
            }
        );

        let err = Operation::parse("wait_for", &args(&["#lobby", "gone"])).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidArguments { .. }));
    }

    #[test]
    fn test_parse_unknown_operation() {
        assert_eq!(
            Operation::parse("dance", &[]).unwrap_err(),
            WorkerError::UnknownOperation("dance".into())
        );
    }

    #[test]
    fn test_parse_wrong_arity() {
        for (name, given) in [
            ("navigate", args(&[])),
            ("click", args(&["a", "b"])),
            ("fill", args(&["#name"])),
            ("health_check", args(&["now"])),
            ("screenshot", args(&["a.png", "b.png"])),
        ] {
            let err = Operation::parse(name, &given).unwrap_err();
            assert!(
                matches!(err, WorkerError::InvalidArguments { .. }),
                "{} with {:?} gave {:?}",
                name,
                given,
                err
            );
        }
    }

    #[test]
    fn test_canonical_names() {
        assert_eq!(Operation::parse("goto", &args(&["u"])).unwrap().name(), "navigate");
        assert_eq!(Operation::HealthCheck.name(), "health_check");
    }

    #[test]
    fn test_channel_id_conversions() {
        assert_eq!(ChannelId::from(42u64), ChannelId::from("42"));
        assert_eq!(ChannelId::from(String::from("lobby")).as_str(), "lobby");
    }
}
