use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "decrease")]
    Decrease,

    #[serde(rename = "increase")]
    Increase,

    #[serde(rename = "toggle")]
    Toggle,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Decrease => "decrease",
            Self::Increase => "increase",
            Self::Toggle => "toggle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeMessage {
    #[serde(rename = "FORWARD_SPEED_COMMAND")]
    ForwardSpeedCommand { command: Command },
}

impl RuntimeMessage {
    pub fn forward(command: Command) -> Self {
        Self::ForwardSpeedCommand { command }
    }

    pub fn parse(payload: &Value) -> Option<Self> {
        match serde_json::from_value(payload.clone()) {
            Ok(message) => Some(message),
            Err(err) => {
                log::debug!("Ignoring runtime message {payload}: {err}");
                None
            }
        }
    }

    pub fn to_value(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
