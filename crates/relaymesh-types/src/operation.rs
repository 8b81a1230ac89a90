//! Operation verbs carried by envelopes.
//!
//! The known variants follow the W3C WoT operation names. Bindings that carry
//! vendor specific verbs use [`Operation::Other`] so nothing is lost in transit.

use serde::{Deserialize, Serialize};

/// The verb of a request, response or notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    ReadProperty,
    WriteProperty,
    ObserveProperty,
    UnobserveProperty,
    ReadMultipleProperties,
    ReadAllProperties,
    WriteMultipleProperties,
    ObserveAllProperties,
    UnobserveAllProperties,
    InvokeAction,
    QueryAction,
    CancelAction,
    SubscribeEvent,
    UnsubscribeEvent,
    SubscribeAllEvents,
    UnsubscribeAllEvents,
    /// Any verb outside the standard set.
    #[serde(untagged)]
    Other(String),
}

impl Operation {
    /// The wire name of this operation.
    pub fn as_str(&self) -> &str {
        match self {
            Operation::ReadProperty => "readproperty",
            Operation::WriteProperty => "writeproperty",
            Operation::ObserveProperty => "observeproperty",
            Operation::UnobserveProperty => "unobserveproperty",
            Operation::ReadMultipleProperties => "readmultipleproperties",
            Operation::ReadAllProperties => "readallproperties",
            Operation::WriteMultipleProperties => "writemultipleproperties",
            Operation::ObserveAllProperties => "observeallproperties",
            Operation::UnobserveAllProperties => "unobserveallproperties",
            Operation::InvokeAction => "invokeaction",
            Operation::QueryAction => "queryaction",
            Operation::CancelAction => "cancelaction",
            Operation::SubscribeEvent => "subscribeevent",
            Operation::UnsubscribeEvent => "unsubscribeevent",
            Operation::SubscribeAllEvents => "subscribeallevents",
            Operation::UnsubscribeAllEvents => "unsubscribeallevents",
            Operation::Other(s) => s,
        }
    }

    /// True for the three property read operations a baseline module answers itself.
    pub fn is_property_read(&self) -> bool {
        matches!(
            self,
            Operation::ReadProperty | Operation::ReadMultipleProperties | Operation::ReadAllProperties
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Operation {
    fn from(s: &str) -> Self {
        // Round-trip through serde so the known names stay in one place.
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .unwrap_or_else(|_| Operation::Other(s.to_string()))
    }
}
