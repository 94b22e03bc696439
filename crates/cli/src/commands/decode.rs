//! Decode command - inspect a wire message

use anyhow::{Result, bail};
use serde_json::{Value, json};
use studylink_call_core::SignalMessage;
use studylink_call_core::signal::codec;

/// Decode `text` and render it as pretty JSON
pub fn render(text: &str) -> Result<String> {
    let Some(message) = codec::decode(text) else {
        bail!("not a call-control message: {:?}", text);
    };

    let payload: Value = match &message {
        SignalMessage::CallRequest(request) => serde_json::to_value(request)?,
        SignalMessage::CallAccepted(response)
        | SignalMessage::CallRejected(response)
        | SignalMessage::UserLeft(response) => serde_json::to_value(response)?,
    };
    let rendered = json!({
        "type": message.kind().tag(),
        "payload": payload,
    });
    Ok(serde_json::to_string_pretty(&rendered)?)
}

/// Execute decode command
pub fn execute(text: &str) -> Result<()> {
    println!("{}", render(text)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_request() {
        let out = render(r#"CALL_REQUEST:{"callId":"c1","callerId":"alice","timestamp":1700000000000}"#).unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["type"], "CALL_REQUEST");
        assert_eq!(value["payload"]["callerId"], "alice");
    }

    #[test]
    fn test_render_rejects_chat_text() {
        assert!(render("lunch at noon?").is_err());
    }
}
