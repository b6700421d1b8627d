use crate::crd::listener::{Listener, ListenerTarget};

/// What a binding item observes of the listener on one load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerView {
    pub synced: bool,
    pub targets: Vec<ListenerTarget>,
}

impl From<&Listener> for ListenerView {
    fn from(listener: &Listener) -> Self {
        ListenerView {
            synced: listener.is_synced(),
            targets: listener.spec.targets.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAction {
    None,
    // The listener object does not exist yet.
    Create(Vec<ListenerTarget>),
    // Replace the target group and mark the listener NotSynced.
    UpdateTargets(Vec<ListenerTarget>),
    ClearTargets,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    // Every load balancer is converged for this pass.
    pub converged: bool,
    pub actions: Vec<(String, ListenerAction)>,
}

impl Evaluation {
    pub fn pending_actions(&self) -> impl Iterator<Item = &(String, ListenerAction)> {
        self.actions
            .iter()
            .filter(|(_, a)| !matches!(a, ListenerAction::None))
    }
}

pub fn targets_match(a: &[ListenerTarget], b: &[ListenerTarget]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// Compares the desired backend against every load balancer of an item.
///
/// The item converges only when all load balancers carry a synced listener
/// with exactly the desired target group.
pub fn evaluate_apply(
    desired: &[ListenerTarget],
    observed: &[(String, Option<ListenerView>)],
) -> Evaluation {
    let mut converged = true;
    let mut actions = Vec::with_capacity(observed.len());
    for (lb, view) in observed.iter() {
        let action = match view {
            None => {
                converged = false;
                ListenerAction::Create(desired.to_vec())
            }
            Some(view) if !view.synced => {
                converged = false;
                ListenerAction::None
            }
            Some(view) if targets_match(&view.targets, desired) => ListenerAction::None,
            Some(_) => {
                converged = false;
                ListenerAction::UpdateTargets(desired.to_vec())
            }
        };
        actions.push((lb.clone(), action));
    }
    Evaluation { converged, actions }
}

/// Drives every listener of an item to an empty, synced target group.
pub fn evaluate_cleanup(observed: &[(String, Option<ListenerView>)]) -> Evaluation {
    let mut converged = true;
    let mut actions = Vec::with_capacity(observed.len());
    for (lb, view) in observed.iter() {
        let action = match view {
            None => ListenerAction::None,
            Some(view) if !view.targets.is_empty() => {
                converged = false;
                ListenerAction::ClearTargets
            }
            Some(view) => {
                if !view.synced {
                    converged = false;
                }
                ListenerAction::None
            }
        };
        actions.push((lb.clone(), action));
    }
    Evaluation { converged, actions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn target(ip: &str, port: u16) -> ListenerTarget {
        ListenerTarget {
            ip: ip.to_string(),
            port,
            weight: 100,
        }
    }

    fn view(synced: bool, targets: Vec<ListenerTarget>) -> Option<ListenerView> {
        Some(ListenerView { synced, targets })
    }

    #[rstest(
        a,
        b,
        expected,
        case(vec![target("10.0.0.1", 80), target("10.0.0.2", 80)], vec![target("10.0.0.2", 80), target("10.0.0.1", 80)], true),
        case(vec![target("10.0.0.1", 80)], vec![target("10.0.0.1", 81)], false),
        case(vec![target("10.0.0.1", 80)], vec![], false),
        case(vec![], vec![], true),
    )]
    fn works_targets_match(a: Vec<ListenerTarget>, b: Vec<ListenerTarget>, expected: bool) {
        assert_eq!(targets_match(&a, &b), expected);
    }

    #[test]
    fn works_evaluate_apply_all_matched() {
        let desired = vec![target("10.0.0.1", 8080)];
        let observed = vec![
            ("lb-1".to_string(), view(true, desired.clone())),
            ("lb-2".to_string(), view(true, desired.clone())),
        ];
        let res = evaluate_apply(&desired, &observed);
        assert!(res.converged);
        assert_eq!(res.pending_actions().count(), 0);
    }

    #[test]
    fn works_evaluate_apply_partial() {
        let desired = vec![target("10.0.0.1", 8080)];
        let observed = vec![
            ("lb-1".to_string(), view(true, desired.clone())),
            ("lb-2".to_string(), view(true, vec![target("10.0.0.9", 8080)])),
            ("lb-3".to_string(), view(false, vec![])),
            ("lb-4".to_string(), None),
        ];
        let res = evaluate_apply(&desired, &observed);
        assert!(!res.converged);
        assert_eq!(
            res.actions,
            vec![
                ("lb-1".to_string(), ListenerAction::None),
                ("lb-2".to_string(), ListenerAction::UpdateTargets(desired.clone())),
                ("lb-3".to_string(), ListenerAction::None),
                ("lb-4".to_string(), ListenerAction::Create(desired.clone())),
            ]
        );
    }

    #[test]
    fn not_converged_while_not_synced() {
        // matching targets do not count until the synchronizer confirms them
        let desired = vec![target("10.0.0.1", 8080)];
        let observed = vec![("lb-1".to_string(), view(false, desired.clone()))];
        let res = evaluate_apply(&desired, &observed);
        assert!(!res.converged);
        assert_eq!(res.pending_actions().count(), 0);
    }

    #[rstest(
        observed,
        converged,
        pending,
        case(vec![("lb-1".to_string(), None)], true, 0),
        case(vec![("lb-1".to_string(), view(true, vec![]))], true, 0),
        case(vec![("lb-1".to_string(), view(false, vec![]))], false, 0),
        case(vec![("lb-1".to_string(), view(true, vec![target("10.0.0.1", 80)]))], false, 1),
        case(vec![("lb-1".to_string(), view(true, vec![])), ("lb-2".to_string(), view(false, vec![target("10.0.0.1", 80)]))], false, 1),
    )]
    fn works_evaluate_cleanup(
        observed: Vec<(String, Option<ListenerView>)>,
        converged: bool,
        pending: usize,
    ) {
        let res = evaluate_cleanup(&observed);
        assert_eq!(res.converged, converged);
        assert_eq!(res.pending_actions().count(), pending);
    }
}
