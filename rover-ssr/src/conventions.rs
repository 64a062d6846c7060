use std::sync::Arc;

/// Action kinds a handler attribute can be bound to. `onpost` pairs with
/// `hx-post`, `onget` with `hx-get`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActionKind {
    Get = 1,
    Post = 2,
    Put = 3,
    Patch = 4,
    Delete = 5,
}

impl ActionKind {
    pub fn from_str(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        match bytes.len() {
            3 => {
                if bytes.eq_ignore_ascii_case(b"get") {
                    Some(Self::Get)
                } else if bytes.eq_ignore_ascii_case(b"put") {
                    Some(Self::Put)
                } else {
                    None
                }
            }
            4 => {
                if bytes.eq_ignore_ascii_case(b"post") {
                    Some(Self::Post)
                } else {
                    None
                }
            }
            5 => {
                if bytes.eq_ignore_ascii_case(b"patch") {
                    Some(Self::Patch)
                } else {
                    None
                }
            }
            6 => {
                if bytes.eq_ignore_ascii_case(b"delete") {
                    Some(Self::Delete)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Put => "put",
            Self::Patch => "patch",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Attribute naming used to pair handler attributes with action attributes
/// and to write the correlation markers.
#[derive(Debug, Clone)]
pub struct ActionConventions {
    pub handler_prefix: Arc<str>,
    pub action_prefix: Arc<str>,
    pub fingerprint_attribute: Arc<str>,
    pub handler_field_name: Arc<str>,
    pub update_attribute: Arc<str>,
}

impl ActionConventions {
    /// The action kind declared by a handler attribute name, e.g. `onpost`.
    pub fn handler_kind(&self, attribute: &str) -> Option<ActionKind> {
        let prefix = self.handler_prefix.as_bytes();
        let bytes = attribute.as_bytes();
        if bytes.len() <= prefix.len() || !bytes[..prefix.len()].eq_ignore_ascii_case(prefix) {
            return None;
        }
        ActionKind::from_str(&attribute[prefix.len()..])
    }

    /// True when `attribute` is the action attribute for `kind`, e.g. `hx-post`.
    pub fn is_action_attribute(&self, attribute: &str, kind: ActionKind) -> bool {
        let prefix = self.action_prefix.as_bytes();
        let bytes = attribute.as_bytes();
        bytes.len() > prefix.len()
            && bytes[..prefix.len()].eq_ignore_ascii_case(prefix)
            && bytes[prefix.len()..].eq_ignore_ascii_case(kind.as_str().as_bytes())
    }
}

impl Default for ActionConventions {
    fn default() -> Self {
        Self {
            handler_prefix: Arc::from("on"),
            action_prefix: Arc::from("hx-"),
            fingerprint_attribute: Arc::from("data-handler"),
            handler_field_name: Arc::from("_handler"),
            update_attribute: Arc::from("data-update"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_parsing_ignores_case() {
        assert_eq!(ActionKind::from_str("POST"), Some(ActionKind::Post));
        assert_eq!(ActionKind::from_str("delete"), Some(ActionKind::Delete));
        assert_eq!(ActionKind::from_str("click"), None);
        assert_eq!(ActionKind::from_str(""), None);
    }

    #[test]
    fn test_handler_kind_requires_prefix() {
        let conventions = ActionConventions::default();
        assert_eq!(conventions.handler_kind("onpost"), Some(ActionKind::Post));
        assert_eq!(conventions.handler_kind("onGet"), Some(ActionKind::Get));
        assert_eq!(conventions.handler_kind("onclick"), None);
        assert_eq!(conventions.handler_kind("post"), None);
        assert_eq!(conventions.handler_kind("on"), None);
    }

    #[test]
    fn test_action_attribute_matches_kind() {
        let conventions = ActionConventions::default();
        assert!(conventions.is_action_attribute("hx-post", ActionKind::Post));
        assert!(conventions.is_action_attribute("HX-POST", ActionKind::Post));
        assert!(!conventions.is_action_attribute("hx-get", ActionKind::Post));
        assert!(!conventions.is_action_attribute("hx-", ActionKind::Post));
    }
}
