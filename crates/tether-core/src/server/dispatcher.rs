//! Request dispatch.
//!
//! Turns one `request` payload into the frames that answer it: zero or more
//! `response-chunk` frames followed by exactly one `response` frame. Every
//! failure before, during or after the handler call becomes an error response.

use super::autosave::AutosaveScheduler;
use super::registry::{CallArgs, MethodRegistry, Param};
use crate::filter::Predicate;
use crate::protocol::{
    callable_source, event, ChunkEnvelope, Frame, ResponseEnvelope, StreamComplete,
};
use crate::TetherError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub(crate) struct Dispatcher {
    registry: Arc<MethodRegistry>,
    autosave: Arc<AutosaveScheduler>,
    chunk_size: usize,
    deadline: Duration,
}

/// The parts of a request the dispatcher reads.
struct Call {
    id: String,
    method: String,
    params: Vec<Value>,
    collection: Option<String>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<MethodRegistry>,
        autosave: Arc<AutosaveScheduler>,
        chunk_size: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            registry,
            autosave,
            chunk_size: chunk_size.max(1),
            deadline,
        }
    }

    /// Handle one request payload and return the frames to send, in order.
    pub(crate) async fn handle(&self, data: Value) -> Vec<Frame> {
        let started = Instant::now();
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let outcome = self.execute(data).await;
        let took = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((method, result)) => {
                debug!("{} {} ok in {}ms", id, method, took);
                self.respond(id, result, took)
            }
            Err(e) => {
                debug!("{} failed in {}ms: {}", id, took, e);
                let mut frames = Vec::with_capacity(1);
                push(
                    &mut frames,
                    event::RESPONSE,
                    &ResponseEnvelope::failure(id, e.to_wire(), took),
                );
                frames
            }
        }
    }

    async fn execute(&self, data: Value) -> Result<(String, Value), TetherError> {
        let call = parse_call(data)?;
        let params = compile_params(call.params)?;

        let handler = self
            .registry
            .get(&call.method)
            .ok_or_else(|| TetherError::MethodNotFound {
                method: call.method.clone(),
            })?;

        debug!(
            "{} dispatching {} ({} params)",
            call.id,
            call.method,
            params.len()
        );
        let args = CallArgs::new(params, call.collection);

        // Spawned so an expired deadline leaves the handler running detached.
        let task = tokio::spawn(handler(args));
        let result = match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok(Ok(value))) => value,
            Ok(Ok(Err(e))) => return Err(e.into()),
            Ok(Err(join_error)) => {
                warn!("Handler for {} did not complete: {}", call.method, join_error);
                return Err(TetherError::Server {
                    name: "ServerError".to_string(),
                    message: format!("{} aborted", call.method),
                });
            }
            Err(_) => {
                warn!(
                    "{} exceeded dispatch deadline of {:?}",
                    call.method, self.deadline
                );
                return Err(TetherError::ServerTimeout {
                    method: call.method,
                    deadline: self.deadline,
                });
            }
        };

        if self.registry.is_mutating(&call.method) {
            self.autosave.record_mutation();
        }
        Ok((call.method, result))
    }

    fn respond(&self, id: String, result: Value, took: u64) -> Vec<Frame> {
        let items = match result {
            Value::Array(items) if items.len() > self.chunk_size => items,
            other => {
                let mut frames = Vec::with_capacity(1);
                push(
                    &mut frames,
                    event::RESPONSE,
                    &ResponseEnvelope::success(id, other, took),
                );
                return frames;
            }
        };

        let count = items.len();
        let total_chunks = count.div_ceil(self.chunk_size) as u32;
        let mut frames = Vec::with_capacity(total_chunks as usize + 1);

        let mut items = items.into_iter();
        for index in 0..total_chunks {
            let chunk: Vec<Value> = items.by_ref().take(self.chunk_size).collect();
            push(
                &mut frames,
                event::RESPONSE_CHUNK,
                &ChunkEnvelope {
                    id: id.clone(),
                    chunk,
                    index,
                    total_chunks,
                },
            );
        }

        let summary = serde_json::to_value(StreamComplete::new(count)).unwrap_or(Value::Null);
        push(
            &mut frames,
            event::RESPONSE,
            &ResponseEnvelope::success(id, summary, took),
        );
        debug!("Streamed {} items in {} chunks", count, total_chunks);
        frames
    }
}

fn push<T: Serialize>(frames: &mut Vec<Frame>, name: &str, payload: &T) {
    match Frame::new(name, payload) {
        Ok(frame) => frames.push(frame),
        Err(e) => warn!("Failed to encode '{}' frame: {}", name, e),
    }
}

fn parse_call(data: Value) -> Result<Call, TetherError> {
    let Value::Object(mut fields) = data else {
        return Err(invalid_request("request payload must be an object"));
    };

    let id = match fields.remove("id") {
        Some(Value::String(id)) => id,
        _ => return Err(invalid_request("request has no string 'id'")),
    };
    let method = match fields.remove("method") {
        Some(Value::String(method)) if !method.trim().is_empty() => method,
        _ => return Err(invalid_request("request has no method")),
    };
    let params = match fields.remove("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(params)) => params,
        Some(_) => return Err(invalid_request("'params' must be an array")),
    };
    let collection = match fields.remove("collection") {
        None | Some(Value::Null) => None,
        Some(Value::String(collection)) => Some(collection),
        Some(_) => return Err(invalid_request("'collection' must be a string")),
    };

    Ok(Call {
        id,
        method,
        params,
        collection,
    })
}

fn invalid_request(message: &str) -> TetherError {
    TetherError::InvalidRequest {
        message: message.to_string(),
    }
}

/// Compile callable payloads, at the top level or one field deep.
fn compile_params(raw: Vec<Value>) -> Result<Vec<Param>, TetherError> {
    raw.into_iter()
        .enumerate()
        .map(|(index, value)| {
            if let Some(source) = callable_source(&value) {
                let predicate = compile(source, &format!("argument {}", index))?;
                return Ok(Param::Predicate(predicate));
            }

            match value {
                Value::Object(map) if map.values().any(|v| callable_source(v).is_some()) => {
                    let mut fields = Map::new();
                    let mut predicates = BTreeMap::new();
                    for (key, field) in map {
                        let compiled = match callable_source(&field) {
                            Some(source) => {
                                Some(compile(source, &format!("argument {}.{}", index, key))?)
                            }
                            None => None,
                        };
                        match compiled {
                            Some(predicate) => {
                                predicates.insert(key, predicate);
                            }
                            None => {
                                fields.insert(key, field);
                            }
                        }
                    }
                    Ok(Param::Options { fields, predicates })
                }
                other => Ok(Param::Value(other)),
            }
        })
        .collect()
}

fn compile(
    source: std::result::Result<&str, String>,
    location: &str,
) -> Result<Arc<Predicate>, TetherError> {
    let source = source.map_err(|message| TetherError::Deserialization {
        message: format!("{}: {}", location, message),
    })?;
    Predicate::compile(source)
        .map(Arc::new)
        .map_err(|e| TetherError::Deserialization {
            message: format!("{}: {}", location, e),
        })
}
