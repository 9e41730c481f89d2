use std::collections::HashMap;

use crate::node::NodeMetadata;
use crate::request::RequestInfo;

/// Expression failure taxonomy. Compile failures drop the owning tag or
/// metric; evaluation failures blank the affected slot for that request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,
    #[error("unknown attribute root: {0}")]
    UnknownRoot(String),
    #[error("unknown request attribute: {0}")]
    UnknownAttribute(String),
    #[error("attribute not present: {0}")]
    NotPresent(String),
    #[error("attribute is not an integer: {0}")]
    NotInteger(String),
}

/// Attribute space an expression reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExprRoot {
    Request,
    Node,
    Peer,
    FilterState,
}

/// A compiled attribute-path expression.
///
/// Expressions are dotted paths over the per-request attribute space:
/// `request.*` (known fields, checked at compile time), `node.*` and
/// `peer.*` (metadata fields, labels, then platform metadata) and
/// `filter_state.*` (host-injected keys). Unknown leaves of the dynamic
/// roots surface at evaluation time.
#[derive(Debug, Clone)]
struct CompiledExpr {
    source: String,
    root: ExprRoot,
    attribute: String,
}

/// Token referencing an integer-valued expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueToken(usize);

/// Attributes an expression is evaluated against for one request.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub request: &'a RequestInfo,
    pub node: &'a NodeMetadata,
    pub peer: Option<&'a NodeMetadata>,
}

/// Owns every compiled expression of one worker configuration.
///
/// String-valued expressions occupy dense slots (their index is the custom
/// dimension slot offset) and are deduplicated by source text. Integer
/// valued expressions back metric value extractors and live in a separate
/// list. `clear` disposes both, which a reconfigure performs first.
#[derive(Debug, Default)]
pub struct ExpressionTable {
    string_exprs: Vec<CompiledExpr>,
    by_source: HashMap<String, usize>,
    value_exprs: Vec<CompiledExpr>,
}

impl ExpressionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles a string-valued expression, reusing the slot of a previously
    /// compiled identical source. Returns the expression's slot index.
    pub fn compile_string(&mut self, source: &str) -> Result<usize, ExprError> {
        if let Some(&idx) = self.by_source.get(source) {
            return Ok(idx);
        }
        let compiled = compile(source)?;
        let idx = self.string_exprs.len();
        self.by_source.insert(source.to_string(), idx);
        self.string_exprs.push(compiled);
        Ok(idx)
    }

    /// Compiles an integer-valued expression used as a metric value
    /// extractor.
    pub fn compile_value(&mut self, source: &str) -> Result<ValueToken, ExprError> {
        let compiled = compile(source)?;
        let token = ValueToken(self.value_exprs.len());
        self.value_exprs.push(compiled);
        Ok(token)
    }

    /// Number of compiled string-valued expressions (custom dimension
    /// slots).
    pub fn string_count(&self) -> usize {
        self.string_exprs.len()
    }

    /// Evaluates the string expression at `slot`.
    pub fn eval_slot(&self, slot: usize, ctx: &EvalContext<'_>) -> Result<String, ExprError> {
        let expr = self
            .string_exprs
            .get(slot)
            .ok_or_else(|| ExprError::NotPresent(format!("slot {slot}")))?;
        evaluate(expr, ctx)
    }

    /// Evaluates an integer expression, parsing the resolved value.
    pub fn eval_value(&self, token: ValueToken, ctx: &EvalContext<'_>) -> Result<u64, ExprError> {
        let expr = self
            .value_exprs
            .get(token.0)
            .ok_or_else(|| ExprError::NotPresent(format!("value token {}", token.0)))?;
        let raw = evaluate(expr, ctx)?;
        raw.parse::<u64>()
            .map_err(|_| ExprError::NotInteger(expr.source.clone()))
    }

    /// Disposes all compiled expressions. Called before every reconfigure so
    /// no handles leak across configurations.
    pub fn clear(&mut self) {
        self.string_exprs.clear();
        self.by_source.clear();
        self.value_exprs.clear();
    }
}

fn compile(source: &str) -> Result<CompiledExpr, ExprError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(ExprError::Empty);
    }

    let (root_name, attribute) = source
        .split_once('.')
        .ok_or_else(|| ExprError::UnknownRoot(source.to_string()))?;
    if attribute.is_empty() {
        return Err(ExprError::UnknownAttribute(source.to_string()));
    }

    let root = match root_name {
        "request" => ExprRoot::Request,
        "node" => ExprRoot::Node,
        "peer" => ExprRoot::Peer,
        "filter_state" => ExprRoot::FilterState,
        other => return Err(ExprError::UnknownRoot(other.to_string())),
    };

    // Request fields are a closed set, so unknown names fail at compile
    // time rather than blanking every request.
    if root == ExprRoot::Request && !is_request_attribute(attribute) {
        return Err(ExprError::UnknownAttribute(attribute.to_string()));
    }

    Ok(CompiledExpr {
        source: source.to_string(),
        root,
        attribute: attribute.to_string(),
    })
}

fn is_request_attribute(name: &str) -> bool {
    matches!(
        name,
        "protocol"
            | "response_code"
            | "response_flags"
            | "grpc_status"
            | "duration"
            | "request_size"
            | "response_size"
            | "source_principal"
            | "destination_principal"
            | "destination_service_host"
            | "destination_service_name"
            | "security_policy"
            | "tcp_sent_bytes"
            | "tcp_received_bytes"
            | "tcp_connections_opened"
            | "tcp_connections_closed"
    )
}

fn evaluate(expr: &CompiledExpr, ctx: &EvalContext<'_>) -> Result<String, ExprError> {
    match expr.root {
        ExprRoot::Request => Ok(request_attribute(ctx.request, &expr.attribute)),
        ExprRoot::Node => node_attribute(ctx.node, &expr.attribute),
        ExprRoot::Peer => {
            let peer = ctx
                .peer
                .ok_or_else(|| ExprError::NotPresent(expr.source.clone()))?;
            node_attribute(peer, &expr.attribute)
        }
        ExprRoot::FilterState => filter_state_attribute(ctx.request, &expr.attribute)
            .ok_or_else(|| ExprError::NotPresent(expr.source.clone())),
    }
}

fn request_attribute(request: &RequestInfo, name: &str) -> String {
    match name {
        "protocol" => request.request_protocol.clone(),
        "response_code" => request.response_code.to_string(),
        "response_flags" => request.response_flags.clone(),
        "grpc_status" => request
            .grpc_status
            .map(|s| s.to_string())
            .unwrap_or_default(),
        "duration" => request.duration.as_millis().to_string(),
        "request_size" => request.request_size.to_string(),
        "response_size" => request.response_size.to_string(),
        "source_principal" => request.source_principal.clone(),
        "destination_principal" => request.destination_principal.clone(),
        "destination_service_host" => request.destination_service_host.clone(),
        "destination_service_name" => request.destination_service_name.clone(),
        "security_policy" => request.security_policy.as_str().to_string(),
        "tcp_sent_bytes" => request.tcp_sent_bytes.to_string(),
        "tcp_received_bytes" => request.tcp_received_bytes.to_string(),
        "tcp_connections_opened" => request.tcp_connections_opened.to_string(),
        "tcp_connections_closed" => request.tcp_connections_closed.to_string(),
        // Unreachable for compiled expressions; kept total for safety.
        _ => String::new(),
    }
}

fn node_attribute(node: &NodeMetadata, name: &str) -> Result<String, ExprError> {
    match name {
        "name" => Ok(node.name.clone()),
        "namespace" => Ok(node.namespace.clone()),
        "owner" => Ok(node.owner.clone()),
        "workload_name" => Ok(node.workload_name.clone()),
        "mesh_version" => Ok(node.mesh_version.clone()),
        other => {
            if let Some(value) = node.label(other) {
                return Ok(value.to_string());
            }
            let platform = node.platform(other);
            if !platform.is_empty() {
                return Ok(platform.to_string());
            }
            Err(ExprError::NotPresent(format!("node.{other}")))
        }
    }
}

fn filter_state_attribute(request: &RequestInfo, name: &str) -> Option<String> {
    match name {
        "operation_id" if !request.operation_id.is_empty() => Some(request.operation_id.clone()),
        "response_class" if !request.response_class.is_empty() => {
            Some(request.response_class.clone())
        }
        _ => None,
    }
}
