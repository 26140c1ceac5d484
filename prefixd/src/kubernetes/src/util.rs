use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, OwnerReference,
};
use kube::{core::ApiResource, core::ObjectMeta, Resource, ResourceExt};

use super::error::Error;

pub fn create_owner_reference<T: Resource<DynamicType = ()>>(owner: &T) -> OwnerReference {
    let res = ApiResource::erase::<T>(&());
    OwnerReference {
        name: owner.name_any(),
        api_version: res.api_version,
        kind: res.kind,
        uid: match &owner.meta().uid {
            Some(uid) => uid.clone(),
            None => "".to_string(),
        },
        block_owner_deletion: Some(true),
        controller: Some(true),
    }
}

pub fn get_namespace<T: Resource<DynamicType = ()>>(resource: &T) -> Result<String, Error> {
    resource.namespace().ok_or(Error::GetNamespace)
}

pub fn get_uid<T: Resource<DynamicType = ()>>(resource: &T) -> Result<String, Error> {
    resource.uid().ok_or(Error::GetUid)
}

pub fn get_namespaced_name<T: Resource<DynamicType = ()>>(resource: &T) -> String {
    match resource.namespace() {
        Some(ns) => format!("{ns}/{}", resource.name_any()),
        None => resource.name_any(),
    }
}

pub fn is_owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid.eq(uid)))
        .unwrap_or(false)
}

pub fn is_deleting<T: Resource<DynamicType = ()>>(resource: &T) -> bool {
    resource.meta().deletion_timestamp.is_some()
}

/// Evaluates a label selector. An empty selector matches everything.
pub fn match_selector(
    labels: &BTreeMap<String, String>,
    selector: &LabelSelector,
) -> Result<bool, Error> {
    if let Some(match_labels) = selector.match_labels.as_ref() {
        for (k, v) in match_labels.iter() {
            if labels.get(k).ne(&Some(v)) {
                return Ok(false);
            }
        }
    }
    if let Some(exprs) = selector.match_expressions.as_ref() {
        for expr in exprs.iter() {
            if !match_expression(labels, expr)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn match_expression(
    labels: &BTreeMap<String, String>,
    expr: &LabelSelectorRequirement,
) -> Result<bool, Error> {
    let values = expr.values.as_deref().unwrap_or_default();
    let value = labels.get(&expr.key);
    match expr.operator.as_str() {
        "In" => {
            if values.is_empty() {
                return Err(Error::InvalidSelector(format!("{} In ()", expr.key)));
            }
            Ok(value.map(|v| values.contains(v)).unwrap_or(false))
        }
        "NotIn" => {
            if values.is_empty() {
                return Err(Error::InvalidSelector(format!("{} NotIn ()", expr.key)));
            }
            Ok(value.map(|v| !values.contains(v)).unwrap_or(true))
        }
        "Exists" => Ok(value.is_some()),
        "DoesNotExist" => Ok(value.is_none()),
        op => Err(Error::InvalidSelector(format!("unknown operator {op}"))),
    }
}

/// Renders a label selector in the query string syntax understood by the API server.
pub fn get_label_selector(selector: &LabelSelector) -> Result<String, Error> {
    let mut terms = Vec::new();
    if let Some(match_labels) = selector.match_labels.as_ref() {
        terms.extend(match_labels.iter().map(|(k, v)| format!("{k}={v}")));
    }
    if let Some(exprs) = selector.match_expressions.as_ref() {
        for expr in exprs.iter() {
            let values = expr.values.as_deref().unwrap_or_default().join(",");
            let term = match expr.operator.as_str() {
                "In" => format!("{} in ({values})", expr.key),
                "NotIn" => format!("{} notin ({values})", expr.key),
                "Exists" => expr.key.clone(),
                "DoesNotExist" => format!("!{}", expr.key),
                op => return Err(Error::InvalidSelector(format!("unknown operator {op}"))),
            };
            terms.push(term);
        }
    }
    Ok(terms.join(","))
}
