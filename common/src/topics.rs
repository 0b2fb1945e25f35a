/// Subscription filter for inbound direct-method requests.
pub const TOPIC_METHODS_FILTER: &str = "$iothub/methods/POST/#";

const METHODS_POST_PREFIX: &str = "$iothub/methods/POST/";
const REQUEST_ID_MARKER: &str = "/?$rid=";

pub fn telemetry_topic(device_id: &str, test_device: bool) -> String {
    if test_device {
        format!("devices/{device_id}/messages/events/testDevice=true")
    } else {
        format!("devices/{device_id}/messages/events/")
    }
}

pub fn method_response_topic(status: u16, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

/// A method invocation addressed to this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    pub name: String,
    pub request_id: String,
}

/// Splits `$iothub/methods/POST/{name}/?$rid={rid}` into its parts.
pub fn parse_method_topic(topic: &str) -> Option<MethodRequest> {
    let rest = topic.strip_prefix(METHODS_POST_PREFIX)?;
    let (name, request_id) = rest.split_once(REQUEST_ID_MARKER)?;
    if name.is_empty() || name.contains('/') || request_id.is_empty() {
        return None;
    }

    Some(MethodRequest {
        name: name.to_string(),
        request_id: request_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_topic_parses() {
        let request = parse_method_topic("$iothub/methods/POST/SetAwayOn/?$rid=42").unwrap();
        assert_eq!(request.name, "SetAwayOn");
        assert_eq!(request.request_id, "42");
        assert_eq!(method_response_topic(200, &request.request_id), "$iothub/methods/res/200/?$rid=42");
    }

    #[test]
    fn foreign_topics_are_ignored() {
        assert!(parse_method_topic("$iothub/twin/res/200/?$rid=1").is_none());
        assert!(parse_method_topic("$iothub/methods/POST//?$rid=1").is_none());
        assert!(parse_method_topic("$iothub/methods/POST/ReadNow").is_none());
    }

    #[test]
    fn test_devices_are_marked_on_the_topic() {
        assert_eq!(telemetry_topic("t1", false), "devices/t1/messages/events/");
        assert_eq!(telemetry_topic("t1", true), "devices/t1/messages/events/testDevice=true");
    }
}
