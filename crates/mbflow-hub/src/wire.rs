use chrono::{DateTime, Utc};
use mbflow_workflow::{Event, EventType};
use serde::{Deserialize, Serialize};

/// Outbound frames, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
  Event {
    event: Event,
    timestamp: DateTime<Utc>,
  },
  Control {
    message: String,
    client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execution_id: Option<String>,
    timestamp: DateTime<Utc>,
  },
}

impl WireMessage {
  pub fn event(event: &Event) -> Self {
    Self::Event {
      event: event.clone(),
      timestamp: Utc::now(),
    }
  }

  pub fn connected(client_id: &str, execution_id: Option<&str>) -> Self {
    Self::Control {
      message: "Connected".to_string(),
      client_id: client_id.to_string(),
      execution_id: execution_id.map(|s| s.to_string()),
      timestamp: Utc::now(),
    }
  }
}

/// Inbound client commands, tagged by `command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
  Subscribe { event_types: Vec<EventType> },
  Unsubscribe { event_types: Vec<EventType> },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn event_frame_shape() {
    let event = Event::new("e1", "w1", EventType::NodeStarted, 1);
    let frame = serde_json::to_value(WireMessage::event(&event)).unwrap();
    assert_eq!(frame["type"], "event");
    assert_eq!(frame["event"]["event_type"], "node.started");
    assert_eq!(frame["event"]["execution_id"], "e1");
    assert!(frame["timestamp"].is_string());
  }

  #[test]
  fn control_frame_shape() {
    let frame =
      serde_json::to_value(WireMessage::connected("c1", Some("e1"))).unwrap();
    assert_eq!(frame["type"], "control");
    assert_eq!(frame["message"], "Connected");
    assert_eq!(frame["client_id"], "c1");
    assert_eq!(frame["execution_id"], "e1");
  }

  #[test]
  fn subscribe_command_parses() {
    let command: ClientCommand = serde_json::from_str(
      r#"{"command": "subscribe", "event_types": ["node.started", "node.completed"]}"#,
    )
    .unwrap();
    match command {
      ClientCommand::Subscribe { event_types } => {
        assert_eq!(event_types, vec![EventType::NodeStarted, EventType::NodeCompleted]);
      }
      _ => panic!("wrong command"),
    }
  }
}
