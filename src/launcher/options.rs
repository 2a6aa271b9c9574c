use serde::{Deserialize, Serialize};

/// Single launch option
///
/// Keys starting with `-` are command-line arguments; any other key is an
/// environment variable of the game process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOption {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl LaunchOption {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether the option is passed as an argument
    pub fn is_argument(&self) -> bool {
        self.key.starts_with('-')
    }
}

/// Merge global defaults with a title's own options
///
/// Globals keep their order with title values substituted on key collision;
/// title-only options follow in their own order.
pub fn merge_options(global: &[LaunchOption], title: &[LaunchOption]) -> Vec<LaunchOption> {
    let mut merged: Vec<LaunchOption> = global
        .iter()
        .map(|option| {
            title
                .iter()
                .rev()
                .find(|o| o.key == option.key)
                .unwrap_or(option)
                .clone()
        })
        .collect();

    for option in title {
        if !merged.iter().any(|o| o.key == option.key) {
            merged.push(option.clone());
        }
    }

    merged
}

/// Command line and environment of a launch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    /// Render options into arguments and environment variables
    pub fn from_options(options: &[LaunchOption]) -> Self {
        let mut command = Self::default();

        for option in options {
            if option.key.is_empty() {
                continue;
            }
            if option.is_argument() {
                command.args.push(option.key.clone());
                if !option.value.is_empty() {
                    command.args.push(option.value.clone());
                }
            } else {
                command.env.push((option.key.clone(), option.value.clone()));
            }
        }

        command
    }
}
