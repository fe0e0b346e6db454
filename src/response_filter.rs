//! Rewrites Docker listing responses so callers only see what they own.
//!
//! Each listing route has its own [`RouteShape`]: where the identifier
//! lives, where labels live, how entries are wrapped, and which fields point
//! at a parent resource whose control is inherited. Bodies that do not match
//! the expected shape are passed through untouched.

use crate::{
    authorization::{authorized_resource_control_access, resource_control_by_resource_id},
    constants::{
        COMPOSE_PROJECT_LABEL, RESOURCE_ANNOTATION_KEY, STACK_NAMESPACE_LABEL,
        SWARM_SERVICE_ID_LABEL,
    },
    error::GatewayError,
    models::{AuthorizationContext, Pair, ResourceControl},
};
use axum::{
    body::{Body, Bytes, to_bytes},
    http::{HeaderMap, HeaderValue, Method, Response, header},
};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingRoute {
    Containers,
    Services,
    Tasks,
    Volumes,
    Networks,
    Secrets,
    Configs,
}

#[derive(Debug, Clone, Copy)]
enum LabelLocation {
    Root,
    Spec,
}

#[derive(Debug, Clone, Copy)]
enum Envelope {
    Array,
    Object(&'static str),
}

#[derive(Debug, Clone, Copy)]
struct RouteShape {
    id_field: &'static str,
    labels: LabelLocation,
    envelope: Envelope,
    owner_fields: &'static [&'static str],
    owner_labels: &'static [&'static str],
}

impl ListingRoute {
    /// Matches a request that was already stripped of its endpoint prefix.
    pub fn match_request(method: &Method, path: &str) -> Option<Self> {
        if method != Method::GET {
            return None;
        }
        match strip_api_version(path).trim_end_matches('/') {
            "/containers/json" => Some(Self::Containers),
            "/services" => Some(Self::Services),
            "/tasks" => Some(Self::Tasks),
            "/volumes" => Some(Self::Volumes),
            "/networks" => Some(Self::Networks),
            "/secrets" => Some(Self::Secrets),
            "/configs" => Some(Self::Configs),
            _ => None,
        }
    }

    fn shape(self) -> RouteShape {
        match self {
            Self::Containers => RouteShape {
                id_field: "Id",
                labels: LabelLocation::Root,
                envelope: Envelope::Array,
                owner_fields: &[],
                owner_labels: &[
                    SWARM_SERVICE_ID_LABEL,
                    STACK_NAMESPACE_LABEL,
                    COMPOSE_PROJECT_LABEL,
                ],
            },
            Self::Services => RouteShape {
                id_field: "ID",
                labels: LabelLocation::Spec,
                envelope: Envelope::Array,
                owner_fields: &[],
                owner_labels: &[STACK_NAMESPACE_LABEL],
            },
            Self::Tasks => RouteShape {
                id_field: "ID",
                labels: LabelLocation::Root,
                envelope: Envelope::Array,
                owner_fields: &["ServiceID"],
                owner_labels: &[],
            },
            Self::Volumes => RouteShape {
                id_field: "Name",
                labels: LabelLocation::Root,
                envelope: Envelope::Object("Volumes"),
                owner_fields: &[],
                owner_labels: &[STACK_NAMESPACE_LABEL, COMPOSE_PROJECT_LABEL],
            },
            Self::Networks => RouteShape {
                id_field: "Id",
                labels: LabelLocation::Root,
                envelope: Envelope::Array,
                owner_fields: &[],
                owner_labels: &[STACK_NAMESPACE_LABEL, COMPOSE_PROJECT_LABEL],
            },
            Self::Secrets | Self::Configs => RouteShape {
                id_field: "ID",
                labels: LabelLocation::Spec,
                envelope: Envelope::Array,
                owner_fields: &[],
                owner_labels: &[STACK_NAMESPACE_LABEL],
            },
        }
    }
}

/// Drops a leading `/v1.41`-style API version segment.
pub fn strip_api_version(path: &str) -> &str {
    let Some(rest) = path.strip_prefix("/v") else {
        return path;
    };
    let (version, tail) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let is_version = !version.is_empty()
        && version.starts_with(|c: char| c.is_ascii_digit())
        && version.chars().all(|c| c.is_ascii_digit() || c == '.');
    if is_version {
        if tail.is_empty() { "/" } else { tail }
    } else {
        path
    }
}

pub struct FilterPolicy<'a> {
    pub ctx: &'a AuthorizationContext,
    pub resource_controls: &'a [ResourceControl],
    pub blacklisted_labels: &'a [Pair],
}

#[derive(Debug, thiserror::Error)]
pub enum ListingDecodeError {
    #[error("listing body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected listing shape: {0}")]
    Shape(&'static str),
}

struct EntryView<'a> {
    object: &'a Map<String, Value>,
    shape: RouteShape,
}

impl EntryView<'_> {
    fn id(&self) -> Option<&str> {
        self.object.get(self.shape.id_field).and_then(Value::as_str)
    }

    fn labels(&self) -> Option<&Map<String, Value>> {
        let holder = match self.shape.labels {
            LabelLocation::Root => Some(self.object),
            LabelLocation::Spec => self.object.get("Spec").and_then(Value::as_object),
        };
        holder
            .and_then(|holder| holder.get("Labels"))
            .and_then(Value::as_object)
    }

    fn label(&self, name: &str) -> Option<&str> {
        self.labels()
            .and_then(|labels| labels.get(name))
            .and_then(Value::as_str)
    }

    fn owner_ids(&self) -> impl Iterator<Item = &str> {
        let fields = self
            .shape
            .owner_fields
            .iter()
            .filter_map(move |field| self.object.get(*field).and_then(Value::as_str));
        let labels = self
            .shape
            .owner_labels
            .iter()
            .filter_map(move |label| self.label(label));
        fields.chain(labels)
    }

    fn is_blacklisted(&self, blacklist: &[Pair]) -> bool {
        !blacklist.is_empty()
            && blacklist
                .iter()
                .any(|pair| self.label(&pair.name) == Some(pair.value.as_str()))
    }

    fn resource_control<'c>(&self, controls: &'c [ResourceControl]) -> Option<&'c ResourceControl> {
        if let Some(id) = self.id()
            && let Some(control) = resource_control_by_resource_id(id, controls)
        {
            return Some(control);
        }
        self.owner_ids()
            .find_map(|owner| resource_control_by_resource_id(owner, controls))
    }
}

fn filter_entries(
    entries: Vec<Value>,
    shape: RouteShape,
    policy: &FilterPolicy<'_>,
) -> Result<Vec<Value>, ListingDecodeError> {
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Object(mut object) = entry else {
            return Err(ListingDecodeError::Shape("listing entry is not an object"));
        };
        let (blacklisted, control) = {
            let view = EntryView {
                object: &object,
                shape,
            };
            (
                view.is_blacklisted(policy.blacklisted_labels),
                view.resource_control(policy.resource_controls).cloned(),
            )
        };
        if blacklisted {
            continue;
        }
        match control {
            None => {}
            Some(control) => {
                if !authorized_resource_control_access(&control, policy.ctx) {
                    continue;
                }
                object.insert(
                    RESOURCE_ANNOTATION_KEY.to_string(),
                    json!({ "ResourceControl": control }),
                );
            }
        }
        kept.push(Value::Object(object));
    }
    Ok(kept)
}

/// Filters one listing body. Pure: the same input and policy always yield
/// the same output, and filtering an already filtered body is a no-op.
pub fn filter_listing(
    route: ListingRoute,
    body: &[u8],
    policy: &FilterPolicy<'_>,
) -> Result<Vec<u8>, ListingDecodeError> {
    let shape = route.shape();
    let document: Value = serde_json::from_slice(body)?;
    let document = match (shape.envelope, document) {
        (Envelope::Array, Value::Array(entries)) => {
            Value::Array(filter_entries(entries, shape, policy)?)
        }
        (Envelope::Object(field), Value::Object(mut wrapper)) => {
            match wrapper.remove(field) {
                Some(Value::Array(entries)) => {
                    wrapper.insert(
                        field.to_string(),
                        Value::Array(filter_entries(entries, shape, policy)?),
                    );
                }
                Some(Value::Null) | None => {
                    wrapper.insert(field.to_string(), Value::Null);
                }
                Some(_) => return Err(ListingDecodeError::Shape("envelope field is not a list")),
            }
            Value::Object(wrapper)
        }
        (Envelope::Array, _) => return Err(ListingDecodeError::Shape("expected a JSON array")),
        (Envelope::Object(_), _) => {
            return Err(ListingDecodeError::Shape("expected a JSON object"));
        }
    };
    Ok(serde_json::to_vec(&document)?)
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("json"))
}

fn is_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| !value.eq_ignore_ascii_case("identity"))
}

/// Applies [`filter_listing`] to an upstream response, replacing the body
/// and its length. Failed responses and non-JSON bodies are returned as-is.
pub async fn filter_listing_response(
    route: ListingRoute,
    response: Response<Body>,
    policy: &FilterPolicy<'_>,
) -> Result<Response<Body>, GatewayError> {
    if !response.status().is_success() || !is_json(response.headers()) || is_encoded(response.headers())
    {
        return Ok(response);
    }

    let (mut parts, body) = response.into_parts();
    let bytes = to_bytes(body, usize::MAX)
        .await
        .map_err(|err| GatewayError::Upstream(format!("failed to read listing body: {err}")))?;

    let filtered = match filter_listing(route, &bytes, policy) {
        Ok(filtered) => {
            debug!(route = ?route, before = bytes.len(), after = filtered.len(), "filtered listing");
            Bytes::from(filtered)
        }
        Err(err) => {
            warn!(route = ?route, error = %err, "listing left unfiltered");
            bytes
        }
    };

    parts.headers.remove(header::TRANSFER_ENCODING);
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(filtered.len()));
    Ok(Response::from_parts(parts, Body::from(filtered)))
}
