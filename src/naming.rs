//! C5 — naming half: maps a payload type to its stable `MessageName` and
//! back. Serialization by content type lives in [`crate::serialization`].

use dashmap::DashMap;

use crate::error::BusError;
use crate::ids::MessageName;

/// Process-local registry mapping type name <-> [`MessageName`]. Populated
/// as handlers are registered; unresolved names surface as
/// `BusError::UnknownMessage`.
#[derive(Default)]
pub struct NameRegistry {
    by_name: DashMap<MessageName, &'static str>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register that `rust_type_name` (typically `std::any::type_name::<T>()`)
    /// is addressed on the wire as `message_name`.
    pub fn register(&self, message_name: MessageName, rust_type_name: &'static str) {
        self.by_name.insert(message_name, rust_type_name);
    }

    pub fn type_for_name(&self, name: &MessageName) -> Result<&'static str, BusError> {
        self.by_name
            .get(name)
            .map(|r| *r.value())
            .ok_or_else(|| BusError::UnknownMessage(name.to_string()))
    }

    pub fn is_registered(&self, name: &MessageName) -> bool {
        self.by_name.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_name_is_unknown() {
        let reg = NameRegistry::new();
        let err = reg.type_for_name(&MessageName::from("Nope")).unwrap_err();
        matches!(err, BusError::UnknownMessage(_));
    }

    #[test]
    fn registered_name_resolves() {
        let reg = NameRegistry::new();
        reg.register(MessageName::from("Ping"), "myapp::Ping");
        assert_eq!(reg.type_for_name(&MessageName::from("Ping")).unwrap(), "myapp::Ping");
    }
}
