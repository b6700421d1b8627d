use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Readiness of one binding item.
///
/// Items move `Initializing -> NotReady | Ready` while the binding is alive
/// and `Deleting -> Cleaned` once the binding is being torn down.
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum ItemPhase {
    #[default]
    Initializing,
    NotReady,
    Ready,
    Deleting,
    Cleaned,
}

impl std::fmt::Display for ItemPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemPhase::Initializing => write!(f, "Initializing"),
            ItemPhase::NotReady => write!(f, "NotReady"),
            ItemPhase::Ready => write!(f, "Ready"),
            ItemPhase::Deleting => write!(f, "Deleting"),
            ItemPhase::Cleaned => write!(f, "Cleaned"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum BindingPhase {
    #[default]
    Initializing,
    NotReady,
    Ready,
    Deleting,
    Cleaned,
}

impl std::fmt::Display for BindingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingPhase::Initializing => write!(f, "Initializing"),
            BindingPhase::NotReady => write!(f, "NotReady"),
            BindingPhase::Ready => write!(f, "Ready"),
            BindingPhase::Deleting => write!(f, "Deleting"),
            BindingPhase::Cleaned => write!(f, "Cleaned"),
        }
    }
}

// Whether the item's listeners have to be looked at in this pass.
// An item seen for the first time only gets `Initializing`.
pub fn needs_observation(prev: Option<ItemPhase>) -> bool {
    prev.is_some()
}

pub fn on_apply(prev: Option<ItemPhase>, all_matched: bool) -> ItemPhase {
    match prev {
        None => ItemPhase::Initializing,
        Some(_) if all_matched => ItemPhase::Ready,
        Some(_) => ItemPhase::NotReady,
    }
}

pub fn on_cleanup(all_cleaned: bool) -> ItemPhase {
    if all_cleaned {
        ItemPhase::Cleaned
    } else {
        ItemPhase::Deleting
    }
}

/// Binding level phase derived from its items.
///
/// `Ready` requires every item to be `Ready` and `Cleaned` requires every item
/// to be `Cleaned`. Anything else is reported as in progress.
pub fn aggregate(items: &[ItemPhase], deleting: bool) -> BindingPhase {
    if deleting {
        if items.iter().all(|p| *p == ItemPhase::Cleaned) {
            return BindingPhase::Cleaned;
        }
        return BindingPhase::Deleting;
    }
    if items.iter().all(|p| *p == ItemPhase::Ready) {
        return BindingPhase::Ready;
    }
    if items.iter().all(|p| *p == ItemPhase::Initializing) {
        return BindingPhase::Initializing;
    }
    BindingPhase::NotReady
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest(
        prev,
        all_matched,
        expected,
        case(None, true, ItemPhase::Initializing),
        case(None, false, ItemPhase::Initializing),
        case(Some(ItemPhase::Initializing), false, ItemPhase::NotReady),
        case(Some(ItemPhase::Initializing), true, ItemPhase::Ready),
        case(Some(ItemPhase::Ready), false, ItemPhase::NotReady),
        case(Some(ItemPhase::NotReady), true, ItemPhase::Ready),
    )]
    fn works_on_apply(prev: Option<ItemPhase>, all_matched: bool, expected: ItemPhase) {
        assert_eq!(on_apply(prev, all_matched), expected);
    }

    #[rstest(
        items,
        deleting,
        expected,
        case(vec![ItemPhase::Ready, ItemPhase::Ready], false, BindingPhase::Ready),
        case(vec![ItemPhase::Ready, ItemPhase::NotReady], false, BindingPhase::NotReady),
        case(vec![ItemPhase::Ready, ItemPhase::Initializing], false, BindingPhase::NotReady),
        case(vec![ItemPhase::Initializing, ItemPhase::Initializing], false, BindingPhase::Initializing),
        case(vec![ItemPhase::Cleaned, ItemPhase::Deleting], true, BindingPhase::Deleting),
        case(vec![ItemPhase::Cleaned, ItemPhase::Cleaned], true, BindingPhase::Cleaned),
        case(vec![ItemPhase::Ready, ItemPhase::Ready], true, BindingPhase::Deleting),
    )]
    fn works_aggregate(items: Vec<ItemPhase>, deleting: bool, expected: BindingPhase) {
        assert_eq!(aggregate(&items, deleting), expected);
    }

    #[test]
    fn works_on_cleanup() {
        assert_eq!(on_cleanup(true), ItemPhase::Cleaned);
        assert_eq!(on_cleanup(false), ItemPhase::Deleting);
        assert!(!needs_observation(None));
        assert!(needs_observation(Some(ItemPhase::NotReady)));
    }
}
