//! Topic naming.
//!
//! One inbox per agent for requests, one reply topic per requester for
//! results, and a single shared heartbeat topic.

pub const HEARTBEAT_TOPIC: &str = "a2a.heartbeat";

pub fn inbox(agent_id: &str) -> String {
    format!("a2a.inbox.{}", agent_id)
}

pub fn replies(agent_id: &str) -> String {
    format!("a2a.replies.{}", agent_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names_are_distinct_per_agent() {
        assert_eq!(inbox("search"), "a2a.inbox.search");
        assert_eq!(replies("manager"), "a2a.replies.manager");
        assert_ne!(inbox("x"), replies("x"));
        assert_ne!(inbox("x"), HEARTBEAT_TOPIC);
    }
}
