//! Selective egress route in the xray template
//!
//! The outbound and the rule pointing at it are checked separately, so a run
//! that stopped between the two is completed rather than skipped.

use serde_json::{json, Map, Value};

use crate::config::RoutingSettings;

fn ensure_object(config: &mut Value) {
    if !config.is_object() {
        *config = Value::Object(Map::new());
    }
}

pub fn has_outbound(config: &Value, tag: &str) -> bool {
    config["outbounds"]
        .as_array()
        .map(|outbounds| outbounds.iter().any(|o| o["tag"] == tag))
        .unwrap_or(false)
}

pub fn has_routing_rule(config: &Value, tag: &str) -> bool {
    config["routing"]["rules"]
        .as_array()
        .map(|rules| rules.iter().any(|r| r["outboundTag"] == tag))
        .unwrap_or(false)
}

/// Append the socks egress outbound unless one with the tag exists
///
/// Returns whether the config changed.
pub fn ensure_outbound(config: &mut Value, routing: &RoutingSettings) -> bool {
    if has_outbound(config, &routing.warp_tag) {
        return false;
    }
    let outbound = json!({
        "protocol": "socks",
        "tag": routing.warp_tag,
        "settings": {
            "servers": [{"address": routing.warp_address, "port": routing.warp_port}]
        }
    });

    ensure_object(config);
    match config["outbounds"].as_array_mut() {
        Some(outbounds) => outbounds.push(outbound),
        None => config["outbounds"] = json!([outbound]),
    }
    true
}

/// Put the domain rule for the egress outbound at the head of the rule list
///
/// Returns whether the config changed.
pub fn ensure_routing_rule(config: &mut Value, routing: &RoutingSettings) -> bool {
    if has_routing_rule(config, &routing.warp_tag) {
        return false;
    }
    let rule = json!({
        "type": "field",
        "outboundTag": routing.warp_tag,
        "domain": routing.warp_domains,
    });

    ensure_object(config);
    ensure_object(&mut config["routing"]);
    match config["routing"]["rules"].as_array_mut() {
        Some(rules) => rules.insert(0, rule),
        None => config["routing"]["rules"] = json!([rule]),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_tag(config: &Value) -> (usize, usize) {
        let outbounds = config["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|o| o["tag"] == "warp")
            .count();
        let rules = config["routing"]["rules"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|r| r["outboundTag"] == "warp")
            .count();
        (outbounds, rules)
    }

    #[test]
    fn test_adds_once() {
        let routing = RoutingSettings::default();
        let mut config = json!({
            "outbounds": [{"protocol": "freedom", "tag": "direct"}],
            "routing": {"rules": [{"type": "field", "outboundTag": "blocked", "ip": ["geoip:private"]}]}
        });

        assert!(ensure_outbound(&mut config, &routing));
        assert!(ensure_routing_rule(&mut config, &routing));
        assert!(!ensure_outbound(&mut config, &routing));
        assert!(!ensure_routing_rule(&mut config, &routing));

        assert_eq!(count_tag(&config), (1, 1));
        assert_eq!(config["routing"]["rules"][0]["outboundTag"], "warp");
        assert_eq!(config["routing"]["rules"][1]["outboundTag"], "blocked");
        assert_eq!(config["outbounds"][1]["settings"]["servers"][0]["port"], 1080);
        assert_eq!(config["routing"]["rules"][0]["domain"].as_array().unwrap().len(), 9);
    }

    #[test]
    fn test_completes_half_applied_route() {
        let routing = RoutingSettings::default();
        let mut config = json!({
            "outbounds": [{"protocol": "socks", "tag": "warp"}]
        });

        assert!(!ensure_outbound(&mut config, &routing));
        assert!(ensure_routing_rule(&mut config, &routing));
        assert_eq!(count_tag(&config), (1, 1));
    }

    #[test]
    fn test_empty_config() {
        let routing = RoutingSettings::default();
        let mut config = Value::Null;
        assert!(ensure_outbound(&mut config, &routing));
        assert!(ensure_routing_rule(&mut config, &routing));
        assert_eq!(count_tag(&config), (1, 1));
    }
}
