use serde_json::{json, Map, Value};
use tessera_common::protocol::ws::{
    CanvasLockAction, CanvasPresenceAction, ClientMessage, PresenceStatus, CHAT_MAX_CHARS,
};

fn load_contract() -> Value {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../contracts/ws-protocol.json");
    let content = std::fs::read_to_string(path).expect("contract file should be readable");
    serde_json::from_str(&content).expect("contract file should be valid JSON")
}

fn contract_strings(contract: &Value, key: &str) -> Vec<String> {
    contract[key]
        .as_array()
        .unwrap_or_else(|| panic!("`{key}` should be an array"))
        .iter()
        .map(|value| value.as_str().expect("entry should be a string").to_string())
        .collect()
}

fn sample_value(field: &str) -> Value {
    match field {
        "status" => json!("online"),
        "action" => json!("acquire"),
        "isTyping" => json!(true),
        _ => json!("x"),
    }
}

#[test]
fn chat_limit_matches_contract() {
    let contract = load_contract();
    assert_eq!(contract["chat_max_chars"].as_u64(), Some(CHAT_MAX_CHARS as u64));
}

#[test]
fn every_client_message_parses_with_only_its_required_fields() {
    let contract = load_contract();
    let messages = contract["client_messages"].as_object().expect("client_messages object");

    for (kind, shape) in messages {
        let mut frame = Map::new();
        frame.insert("type".to_string(), json!(kind));
        for field in shape["required"].as_array().expect("required array") {
            let field = field.as_str().expect("field name");
            frame.insert(field.to_string(), sample_value(field));
        }

        let parsed: ClientMessage = serde_json::from_value(Value::Object(frame.clone()))
            .unwrap_or_else(|error| panic!("`{kind}` should parse from {frame:?}: {error}"));
        assert_eq!(parsed.kind(), kind);
    }
}

#[test]
fn client_messages_missing_required_fields_are_rejected() {
    let contract = load_contract();
    let messages = contract["client_messages"].as_object().expect("client_messages object");

    for (kind, shape) in messages {
        let required = shape["required"].as_array().expect("required array");
        for omitted in required {
            let mut frame = Map::new();
            frame.insert("type".to_string(), json!(kind));
            for field in required.iter().filter(|field| *field != omitted) {
                let field = field.as_str().expect("field name");
                frame.insert(field.to_string(), sample_value(field));
            }

            assert!(
                serde_json::from_value::<ClientMessage>(Value::Object(frame)).is_err(),
                "`{kind}` without `{omitted}` must be rejected",
            );
        }
    }
}

#[test]
fn enum_vocabularies_match_contract() {
    let contract = load_contract();

    let statuses = [PresenceStatus::Online, PresenceStatus::Idle, PresenceStatus::Offline]
        .map(|status| status.as_str().to_string());
    assert_eq!(statuses.to_vec(), contract_strings(&contract, "presence_statuses"));

    let presence_actions =
        [CanvasPresenceAction::Viewing, CanvasPresenceAction::Editing, CanvasPresenceAction::Left]
            .map(|action| serde_json::to_value(action).expect("action serializes"));
    assert_eq!(
        presence_actions.to_vec(),
        contract_strings(&contract, "canvas_presence_actions")
            .into_iter()
            .map(Value::String)
            .collect::<Vec<_>>()
    );

    let lock_actions =
        [CanvasLockAction::Acquired, CanvasLockAction::Denied, CanvasLockAction::Released]
            .map(|action| serde_json::to_value(action).expect("action serializes"));
    assert_eq!(
        lock_actions.to_vec(),
        contract_strings(&contract, "canvas_lock_actions")
            .into_iter()
            .map(Value::String)
            .collect::<Vec<_>>()
    );
}
