//! Traffic recording. The pipeline reports every stage to a [`Recorder`];
//! recording failures are logged and never affect the proxied exchange.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use hyper::HeaderMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::proxy::context::RequestContext;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("No record with id {0}")]
    UnknownRecord(u64),
}

pub trait Recorder: Send + Sync {
    fn append_id(&self) -> u64;

    fn update_raw_req(&self, _ctx: &RequestContext) -> Result<(), RecorderError> {
        Ok(())
    }
    fn update_user_req(&self, _ctx: &RequestContext) -> Result<(), RecorderError> {
        Ok(())
    }
    fn update_raw_req_body(&self, _id: u64, _size: usize) -> Result<(), RecorderError> {
        Ok(())
    }
    fn update_raw_res(&self, _ctx: &RequestContext) -> Result<(), RecorderError> {
        Ok(())
    }
    fn update_raw_res_body(&self, _id: u64, _size: usize) -> Result<(), RecorderError> {
        Ok(())
    }
    fn update_user_res(&self, _ctx: &RequestContext) -> Result<(), RecorderError> {
        Ok(())
    }
    fn update_user_res_end(&self, _ctx: &RequestContext) -> Result<(), RecorderError> {
        Ok(())
    }

    /// Completed records, most recent first.
    fn logs(&self) -> Vec<Record> {
        Vec::new()
    }
    fn log(&self, _id: u64) -> Option<Record> {
        None
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: u64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub protocol: String,
    pub req_header: HashMap<String, String>,
    pub req_body_size: Option<usize>,
    pub status_code: Option<u16>,
    pub res_header: HashMap<String, String>,
    pub length: Option<usize>,
    pub mime: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between the request arriving and the response being delivered.
    pub duration: Option<i64>,
    pub completed: bool,
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect()
}

/// Keeps every record in memory for the lifetime of the process.
#[derive(Default)]
pub struct MemoryRecorder {
    next_id: AtomicU64,
    records: Mutex<BTreeMap<u64, Record>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<F: FnOnce(&mut Record)>(&self, id: u64, f: F) -> Result<(), RecorderError> {
        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or(RecorderError::UnknownRecord(id))?;
        f(record);
        Ok(())
    }
}

impl Recorder for MemoryRecorder {
    fn append_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn update_raw_req(&self, ctx: &RequestContext) -> Result<(), RecorderError> {
        let request = &ctx.raw_request;
        let record = Record {
            id: ctx.record_id,
            method: request.method.to_string(),
            url: request.url.to_string(),
            host: request.url.host_str().unwrap_or_default().to_owned(),
            path: request.url.path().to_owned(),
            protocol: ctx.protocol.as_str().to_owned(),
            req_header: header_map(&request.headers),
            start_time: ctx.timings.client_start,
            ..Record::default()
        };
        self.records.lock().insert(ctx.record_id, record);
        Ok(())
    }

    fn update_user_req(&self, ctx: &RequestContext) -> Result<(), RecorderError> {
        let request = &ctx.request;
        self.with_record(ctx.record_id, |record| {
            record.method = request.method.to_string();
            record.url = request.url.to_string();
            record.host = request.url.host_str().unwrap_or_default().to_owned();
            record.path = request.url.path().to_owned();
            record.req_header = header_map(&request.headers);
        })
    }

    fn update_raw_req_body(&self, id: u64, size: usize) -> Result<(), RecorderError> {
        self.with_record(id, |record| record.req_body_size = Some(size))
    }

    fn update_raw_res(&self, ctx: &RequestContext) -> Result<(), RecorderError> {
        let Some(ref response) = ctx.raw_response else {
            return Ok(());
        };
        self.with_record(ctx.record_id, |record| {
            record.status_code = Some(response.status.as_u16());
            record.res_header = header_map(&response.headers);
        })
    }

    fn update_raw_res_body(&self, id: u64, size: usize) -> Result<(), RecorderError> {
        self.with_record(id, |record| record.length = Some(size))
    }

    fn update_user_res(&self, ctx: &RequestContext) -> Result<(), RecorderError> {
        let Some(ref response) = ctx.response else {
            return Ok(());
        };
        self.with_record(ctx.record_id, |record| {
            record.status_code = Some(response.status.as_u16());
            record.res_header = header_map(&response.headers);
            record.mime = response
                .headers
                .get(hyper::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(';').next())
                .map(|v| v.trim().to_owned());
            if let Some(ref body) = response.body {
                record.length = Some(body.len());
            }
        })
    }

    fn update_user_res_end(&self, ctx: &RequestContext) -> Result<(), RecorderError> {
        let end = ctx.timings.client_end.unwrap_or_else(Utc::now);
        self.with_record(ctx.record_id, |record| {
            record.end_time = Some(end);
            record.duration = record.start_time.map(|start| (end - start).num_milliseconds());
            record.completed = true;
        })
    }

    fn logs(&self) -> Vec<Record> {
        self.records
            .lock()
            .values()
            .rev()
            .filter(|record| record.completed)
            .cloned()
            .collect()
    }

    fn log(&self, id: u64) -> Option<Record> {
        self.records.lock().get(&id).cloned()
    }
}
