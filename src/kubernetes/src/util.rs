use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{core::ApiResource, Resource, ResourceExt};

use super::error::Error;

pub fn create_owner_reference<T: Resource<DynamicType = ()>>(owner: &T) -> OwnerReference {
    let res = ApiResource::erase::<T>(&());
    OwnerReference {
        name: owner.name_any(),
        api_version: res.api_version,
        kind: res.kind,
        uid: owner.meta().uid.clone().unwrap_or_default(),
        block_owner_deletion: Some(true),
        controller: Some(true),
    }
}

pub fn get_namespace<T: Resource<DynamicType = ()>>(resource: &T) -> Result<String, Error> {
    resource.namespace().ok_or(Error::GetNamespace)
}

pub fn get_namespaced_name<T: Resource<DynamicType = ()>>(resource: &T) -> String {
    match resource.namespace() {
        Some(ns) => format!("{ns}/{}", resource.name_any()),
        None => resource.name_any(),
    }
}

// JSON pointer escaping for annotation and label keys.
pub fn escape_slash(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

pub fn has_finalizer<T: Resource<DynamicType = ()>>(resource: &T, finalizer: &str) -> bool {
    resource.finalizers().iter().any(|f| f == finalizer)
}

/// Converts an arbitrary string into a DNS-1123 label compatible name.
pub fn sanitize_name(s: &str) -> String {
    let mut name = s
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect::<String>();
    name.truncate(63);
    name.trim_matches('-').to_string()
}

pub fn diff<T: PartialEq + Clone>(prev: &[T], now: &[T]) -> (Vec<T>, Vec<T>, Vec<T>) {
    let removed = prev
        .iter()
        .filter(|p| !now.contains(p))
        .cloned()
        .collect::<Vec<T>>();
    let added = now
        .iter()
        .filter(|n| !prev.contains(n))
        .cloned()
        .collect::<Vec<T>>();
    let shared = prev
        .iter()
        .filter(|p| now.contains(p))
        .cloned()
        .collect::<Vec<T>>();
    (added, shared, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest(
        input,
        expected,
        case("portd.lbport.io/binding-items", "portd.lbport.io~1binding-items"),
        case("a~b/c", "a~0b~1c"),
    )]
    fn works_escape_slash(input: &str, expected: &str) {
        assert_eq!(escape_slash(input), expected);
    }

    #[rstest(
        input,
        expected,
        case("pool-a-it1-lb.1-tcp-30000", "pool-a-it1-lb-1-tcp-30000"),
        case("Pool_A", "pool-a"),
        case("-lb/x-", "lb-x"),
    )]
    fn works_sanitize_name(input: &str, expected: &str) {
        assert_eq!(sanitize_name(input), expected);
    }

    #[rstest(
        prev,
        now,
        expected,
        case(vec![1, 2, 3], vec![2, 3, 4], (vec![4], vec![2, 3], vec![1])),
        case(vec![], vec![1], (vec![1], vec![], vec![])),
    )]
    fn works_diff(prev: Vec<u32>, now: Vec<u32>, expected: (Vec<u32>, Vec<u32>, Vec<u32>)) {
        assert_eq!(diff(&prev, &now), expected);
    }
}
