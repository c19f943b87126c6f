use common::Payload;
use serde_json::Value;

/// Required payload fields per job type. Types not listed here have no
/// requirements and pass through unchecked.
pub fn required_fields(job_type: &str) -> &'static [&'static str] {
    match job_type {
        "instance.start" | "instance.stop" | "instance.restart" | "instance.update"
        | "instance.reinstall" => &["instance_id"],
        "instance.action" => &["instance_id", "action"],
        "instance.backup.create" => &["instance_id", "backup_id"],
        "instance.query" => &["instance_id", "query_type"],
        "instance.disk.scan" => &["instance_id"],
        "node.disk.stat" => &["node_id"],
        "firewall.open_ports" | "firewall.close_ports" => &["ports"],
        "ts3.node.install" => &["node_id", "download_url"],
        "ts3.node.start" | "ts3.node.stop" | "ts3.node.restart" | "ts3.node.update" => &["node_id"],
        "ts3.instance.create" => &["instance_id", "voice_port", "query_port", "file_port", "db_mode"],
        "ts3.virtual.create" => &["virtual_server_id", "node_id", "voice_port", "name"],
        "ts3.virtual.start" | "ts3.virtual.stop" | "ts3.virtual.delete"
        | "ts3.virtual.token.rotate" => &["virtual_server_id", "sid"],
        "sinusbot.node.install" => &["node_id", "download_url"],
        "sinusbot.node.start" | "sinusbot.node.stop" => &["node_id"],
        "ssh.key.provision" => &["ssh_key_id", "public_key", "username"],
        "ssh.key.revoke" => &["ssh_key_id", "username"],
        "server.status.check" => &["status_check_id", "host", "port"],
        _ => &[],
    }
}

/// Presence check only; a JSON null counts as missing.
pub fn validate(job_type: &str, payload: &Payload) -> Vec<String> {
    required_fields(job_type)
        .iter()
        .filter(|field| matches!(payload.get(**field), None | Some(Value::Null)))
        .map(|field| format!("missing required field: {field}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reports_each_missing_field() {
        let mut payload = Payload::new();
        payload.insert("instance_id".into(), json!("i-1"));
        payload.insert("voice_port".into(), json!(9987));
        payload.insert("db_mode".into(), Value::Null);
        let errors = validate("ts3.instance.create", &payload);
        assert_eq!(
            errors,
            vec![
                "missing required field: query_port".to_string(),
                "missing required field: file_port".to_string(),
                "missing required field: db_mode".to_string(),
            ]
        );
    }

    #[test]
    fn unknown_types_pass_through() {
        assert!(validate("billing.invoice.render", &Payload::new()).is_empty());
    }

    #[test]
    fn values_are_not_type_checked() {
        let mut payload = Payload::new();
        payload.insert("ports".into(), json!(""));
        assert!(validate("firewall.open_ports", &payload).is_empty());
    }
}
