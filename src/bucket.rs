//! Bucket identities and route classification.
//!
//! A [`BucketKey`] names one throttling domain. Global groups are shared by every call of that
//! kind; owner-scoped groups get one bucket per owner id (for example one per guild for
//! message edits). Which group a route belongs to lives in a [`BucketTable`], which is plain
//! data so it can be corrected without touching the dispatcher.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketScope {
    Global,
    OwnerScoped,
}

/// Rate-limit groups known to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteGroup {
    GeneralRest,
    DirectMessage,
    SendEditMessage,
    GeneralGateway,
    UpdateStatus,
    OwnerSendEditMessage,
    OwnerDeleteMessage,
    OwnerDeleteMessages,
    OwnerModifyMember,
    OwnerNickname,
}

/// Client-side call budget for one group: at most `window_count` calls per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketDefinition {
    pub window_count: u32,
    #[serde(rename = "window_ms", with = "millis")]
    pub window: Duration,
}

impl BucketDefinition {
    pub const fn new(window_count: u32, window: Duration) -> Self {
        Self { window_count, window }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl RouteGroup {
    pub fn scope(self) -> BucketScope {
        match self {
            RouteGroup::GeneralRest
            | RouteGroup::DirectMessage
            | RouteGroup::SendEditMessage
            | RouteGroup::GeneralGateway
            | RouteGroup::UpdateStatus => BucketScope::Global,
            RouteGroup::OwnerSendEditMessage
            | RouteGroup::OwnerDeleteMessage
            | RouteGroup::OwnerDeleteMessages
            | RouteGroup::OwnerModifyMember
            | RouteGroup::OwnerNickname => BucketScope::OwnerScoped,
        }
    }

    /// Global group used when an owner-scoped route is called without an owner.
    pub fn global_fallback(self) -> RouteGroup {
        match self {
            RouteGroup::OwnerSendEditMessage => RouteGroup::DirectMessage,
            RouteGroup::OwnerDeleteMessage
            | RouteGroup::OwnerDeleteMessages
            | RouteGroup::OwnerModifyMember
            | RouteGroup::OwnerNickname => RouteGroup::GeneralRest,
            global => global,
        }
    }

    /// Default local window, or `None` when only server-declared limits apply.
    pub fn default_window(self) -> Option<BucketDefinition> {
        let def = |count, secs| Some(BucketDefinition::new(count, Duration::from_secs(secs)));
        match self {
            RouteGroup::GeneralRest => None,
            RouteGroup::DirectMessage => def(5, 5),
            RouteGroup::SendEditMessage => def(50, 10),
            RouteGroup::GeneralGateway => def(120, 60),
            RouteGroup::UpdateStatus => def(5, 60),
            RouteGroup::OwnerSendEditMessage => def(5, 5),
            RouteGroup::OwnerDeleteMessage => def(5, 1),
            RouteGroup::OwnerDeleteMessages => def(1, 1),
            RouteGroup::OwnerModifyMember => def(10, 10),
            RouteGroup::OwnerNickname => def(1, 1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RouteGroup::GeneralRest => "general_rest",
            RouteGroup::DirectMessage => "direct_message",
            RouteGroup::SendEditMessage => "send_edit_message",
            RouteGroup::GeneralGateway => "general_gateway",
            RouteGroup::UpdateStatus => "update_status",
            RouteGroup::OwnerSendEditMessage => "owner_send_edit_message",
            RouteGroup::OwnerDeleteMessage => "owner_delete_message",
            RouteGroup::OwnerDeleteMessages => "owner_delete_messages",
            RouteGroup::OwnerModifyMember => "owner_modify_member",
            RouteGroup::OwnerNickname => "owner_nickname",
        }
    }
}

/// Identity of one throttling domain. Equal fields mean the same bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey {
    scope: BucketScope,
    group: RouteGroup,
    owner: Option<u64>,
}

impl BucketKey {
    /// Key for `group`, scoped to `owner` when the group is owner-scoped.
    ///
    /// An owner-scoped group without an owner falls back to its global counterpart; a global
    /// group ignores the owner.
    pub fn classify(group: RouteGroup, owner: Option<u64>) -> Self {
        match (group.scope(), owner) {
            (BucketScope::OwnerScoped, Some(owner)) => {
                Self { scope: BucketScope::OwnerScoped, group, owner: Some(owner) }
            }
            (BucketScope::OwnerScoped, None) => Self::global(group.global_fallback()),
            (BucketScope::Global, _) => Self::global(group),
        }
    }

    pub fn global(group: RouteGroup) -> Self {
        let group = group.global_fallback();
        Self { scope: BucketScope::Global, group, owner: None }
    }

    pub fn owned(group: RouteGroup, owner: u64) -> Self {
        Self::classify(group, Some(owner))
    }

    /// Bucket shared by outbound gateway control frames.
    pub fn gateway() -> Self {
        Self::global(RouteGroup::GeneralGateway)
    }

    pub fn scope(&self) -> BucketScope {
        self.scope
    }

    pub fn group(&self) -> RouteGroup {
        self.group
    }

    pub fn owner(&self) -> Option<u64> {
        self.owner
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(owner) => write!(f, "{}/{}", self.group.as_str(), owner),
            None => f.write_str(self.group.as_str()),
        }
    }
}

/// One row of a [`BucketTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub verb: Verb,
    /// Slash-separated pattern; `{name}` segments match any single segment.
    pub pattern: String,
    pub group: RouteGroup,
    /// The group was inferred from the route's shape and still needs confirming against the
    /// service's published limits.
    #[serde(default)]
    pub ambiguous: bool,
}

impl RouteRule {
    pub fn new(verb: Verb, pattern: &str, group: RouteGroup) -> Self {
        Self { verb, pattern: pattern.to_owned(), group, ambiguous: false }
    }

    pub fn ambiguous(mut self) -> Self {
        self.ambiguous = true;
        self
    }

    fn matches(&self, verb: Verb, route: &str) -> bool {
        if self.verb != verb {
            return false;
        }
        let mut pattern = segments(&self.pattern);
        let mut route = segments(route);
        loop {
            match (pattern.next(), route.next()) {
                (None, None) => return true,
                (Some(p), Some(r)) => {
                    let placeholder = p.starts_with('{') && p.ends_with('}');
                    if !placeholder && p != r {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }
}

fn segments(route: &str) -> impl Iterator<Item = &str> {
    let path = route.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|s| !s.is_empty())
}

/// Ordered route-pattern to route-group mapping. First match wins; unmatched routes belong
/// to [`RouteGroup::GeneralRest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTable {
    rules: Vec<RouteRule>,
}

impl Default for BucketTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl BucketTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        for rule in rules.iter().filter(|r| r.ambiguous) {
            tracing::warn!(
                verb = %rule.verb,
                pattern = %rule.pattern,
                group = rule.group.as_str(),
                "bucket group inferred from route shape; confirm against the service's rate-limit groups"
            );
        }
        Self { rules }
    }

    /// Load a table from a JSON array of rules.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Vec<RouteRule>>(json).map(Self::new)
    }

    /// Routes used by the client facade.
    ///
    /// Message routes carry only the channel id while their limits are per guild, so their
    /// owner is supplied by the caller and the rows are flagged ambiguous.
    pub fn standard() -> Self {
        use RouteGroup::*;
        Self::new(vec![
            RouteRule::new(Verb::Post, "channels/{channel_id}/messages", OwnerSendEditMessage)
                .ambiguous(),
            RouteRule::new(
                Verb::Patch,
                "channels/{channel_id}/messages/{message_id}",
                OwnerSendEditMessage,
            )
            .ambiguous(),
            RouteRule::new(
                Verb::Delete,
                "channels/{channel_id}/messages/{message_id}",
                OwnerDeleteMessage,
            )
            .ambiguous(),
            RouteRule::new(
                Verb::Post,
                "channels/{channel_id}/messages/bulk-delete",
                OwnerDeleteMessages,
            )
            .ambiguous(),
            RouteRule::new(Verb::Patch, "guilds/{guild_id}/members/@me/nick", OwnerNickname),
            RouteRule::new(Verb::Patch, "guilds/{guild_id}/members/{user_id}", OwnerModifyMember),
            RouteRule::new(Verb::Get, "gateway", GeneralRest),
        ])
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn ambiguous_rules(&self) -> impl Iterator<Item = &RouteRule> {
        self.rules.iter().filter(|r| r.ambiguous)
    }

    pub fn lookup(&self, verb: Verb, route: &str) -> RouteGroup {
        self.rules
            .iter()
            .find(|rule| rule.matches(verb, route))
            .map(|rule| rule.group)
            .unwrap_or(RouteGroup::GeneralRest)
    }

    pub fn classify(&self, verb: Verb, route: &str, owner: Option<u64>) -> BucketKey {
        BucketKey::classify(self.lookup(verb, route), owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_scoped_groups_key_by_owner() {
        let a = BucketKey::owned(RouteGroup::OwnerSendEditMessage, 42);
        let b = BucketKey::owned(RouteGroup::OwnerSendEditMessage, 42);
        let c = BucketKey::owned(RouteGroup::OwnerSendEditMessage, 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.scope(), BucketScope::OwnerScoped);
        assert_eq!(a.owner(), Some(42));
        assert_eq!(a.to_string(), "owner_send_edit_message/42");
    }

    #[test]
    fn missing_owner_falls_back_to_global_group() {
        let dm = BucketKey::classify(RouteGroup::OwnerSendEditMessage, None);
        assert_eq!(dm, BucketKey::global(RouteGroup::DirectMessage));

        let delete = BucketKey::classify(RouteGroup::OwnerDeleteMessage, None);
        assert_eq!(delete.group(), RouteGroup::GeneralRest);
        assert_eq!(delete.owner(), None);
    }

    #[test]
    fn global_groups_ignore_owner() {
        let key = BucketKey::classify(RouteGroup::UpdateStatus, Some(9));
        assert_eq!(key, BucketKey::global(RouteGroup::UpdateStatus));
        assert_eq!(key.scope(), BucketScope::Global);
    }

    #[test]
    fn table_matches_placeholders_and_ignores_query() {
        let table = BucketTable::standard();
        assert_eq!(
            table.lookup(Verb::Post, "/channels/123/messages"),
            RouteGroup::OwnerSendEditMessage
        );
        assert_eq!(
            table.lookup(Verb::Delete, "channels/1/messages/2"),
            RouteGroup::OwnerDeleteMessage
        );
        assert_eq!(
            table.lookup(Verb::Post, "channels/1/messages/bulk-delete"),
            RouteGroup::OwnerDeleteMessages
        );
        assert_eq!(
            table.lookup(Verb::Patch, "guilds/5/members/@me/nick"),
            RouteGroup::OwnerNickname
        );
        assert_eq!(table.lookup(Verb::Get, "gateway?v=6"), RouteGroup::GeneralRest);
        assert_eq!(table.lookup(Verb::Get, "channels/1/messages"), RouteGroup::GeneralRest);
    }

    #[test]
    fn table_classifies_with_owner() {
        let table = BucketTable::standard();
        let guild = table.classify(Verb::Post, "channels/1/messages", Some(77));
        assert_eq!(guild, BucketKey::owned(RouteGroup::OwnerSendEditMessage, 77));
        let dm = table.classify(Verb::Post, "channels/1/messages", None);
        assert_eq!(dm.group(), RouteGroup::DirectMessage);
    }

    #[test]
    fn standard_table_flags_inferred_routes() {
        let table = BucketTable::standard();
        let ambiguous: Vec<_> = table.ambiguous_rules().map(|r| r.group).collect();
        assert!(ambiguous.contains(&RouteGroup::OwnerSendEditMessage));
        assert!(!ambiguous.contains(&RouteGroup::OwnerNickname));
    }

    #[test]
    fn table_loads_from_json() {
        let table = BucketTable::from_json(
            r#"[{"verb":"PUT","pattern":"guilds/{id}/bans/{user}","group":"owner_modify_member","ambiguous":true}]"#,
        )
        .unwrap();
        assert_eq!(table.lookup(Verb::Put, "guilds/1/bans/2"), RouteGroup::OwnerModifyMember);
        assert_eq!(table.ambiguous_rules().count(), 1);
    }

    #[test]
    fn default_windows() {
        let dm = RouteGroup::DirectMessage.default_window().unwrap();
        assert_eq!(dm.window_count, 5);
        assert_eq!(dm.window, Duration::from_secs(5));
        assert!(RouteGroup::GeneralRest.default_window().is_none());
    }

    #[derive(Clone)]
    struct SharedWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn ambiguous_rules_are_logged_on_load() {
        let buffer = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::writer::BoxMakeWriter::new(SharedWriter(
                buffer.clone(),
            )))
            .with_ansi(false)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        BucketTable::new(vec![
            RouteRule::new(Verb::Get, "gateway", RouteGroup::GeneralRest),
            RouteRule::new(Verb::Put, "channels/{id}/pins/{msg}", RouteGroup::OwnerModifyMember)
                .ambiguous(),
        ]);

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("bucket group inferred from route shape"));
        assert!(logs.contains("channels/{id}/pins/{msg}"));
        assert!(!logs.contains("pattern=gateway"));
    }
}
