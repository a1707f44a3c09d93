pub const TOPIC_ROOT: &str = "things";

pub fn telemetry_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/telemetry")
}

pub fn inbox_filter(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/inbox/#")
}

pub fn command_filter(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/commands/+/+")
}

pub fn command_response_topic(device_id: &str, request_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/command-responses/{request_id}")
}

pub fn desired_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/config/desired")
}

pub fn desired_patch_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/config/desired/patch")
}

pub fn reported_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/config/reported")
}

/// Classification of a topic received on the device's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    Inbox,
    Command { name: &'a str, request_id: &'a str },
    Desired,
    DesiredPatch,
    Other,
}

pub fn classify<'a>(device_id: &str, topic: &'a str) -> InboundTopic<'a> {
    let Some(rest) = topic
        .strip_prefix(TOPIC_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|rest| rest.strip_prefix(device_id))
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return InboundTopic::Other;
    };

    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        ["inbox", ..] => InboundTopic::Inbox,
        ["commands", name, request_id] => InboundTopic::Command {
            name: *name,
            request_id: *request_id,
        },
        ["config", "desired"] => InboundTopic::Desired,
        ["config", "desired", "patch"] => InboundTopic::DesiredPatch,
        _ => InboundTopic::Other,
    }
}
