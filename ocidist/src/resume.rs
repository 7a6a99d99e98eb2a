//! A GET body that survives mid-stream disconnects.
//!
//! When the underlying read fails (or the connection closes early), a
//! follow-up request with a `Range` header picks up from the transferred
//! offset. Servers that ignore `Range` get their prefix discarded up to a
//! safety cap; a 416 with `bytes */N` after we already transferred N bytes
//! reads as EOF. Callers see one continuous stream and the status of the
//! original response.

use std::sync::Arc;

use bytes::Bytes;
use log::{trace, warn};
use reqwest::{header, Method, Response, StatusCode};
use tokio_util::io::StreamReader;

use crate::transport::{failure, Transport};
use crate::Error;

// discarding more than this to emulate a Range request is worse than failing
const DISCARD_CAP: u64 = 100 * 1024 * 1024;

// consecutive resumes with no forward progress before giving up
const MAX_STALLS: u32 = 3;

pub struct ResumableBody {
    transport: Arc<Transport>,
    url: String,
    response: Option<Response>,
    pending: Option<Bytes>,
    offset: u64,
    total: Option<u64>,
    status: StatusCode,
    stalls: u32,
    done: bool,
}

// `Content-Range: bytes <s>-<e>/<total|*>`
fn parse_content_range(res: &Response) -> Option<(u64, Option<u64>)> {
    let raw = res.headers().get(header::CONTENT_RANGE)?.to_str().ok()?;
    let spec = raw.strip_prefix("bytes ")?;
    let (range, total) = spec.split_once('/')?;
    let start: u64 = range.split_once('-')?.0.parse().ok()?;
    let total = if total == "*" {
        None
    } else {
        Some(total.parse().ok()?)
    };
    Some((start, total))
}

// `Content-Range: bytes */<total>` on a 416
fn parse_unsatisfied_total(res: &Response) -> Option<u64> {
    let raw = res.headers().get(header::CONTENT_RANGE)?.to_str().ok()?;
    raw.strip_prefix("bytes */")?.parse().ok()
}

impl ResumableBody {
    pub(crate) fn new(transport: Arc<Transport>, url: String, response: Response) -> ResumableBody {
        let status = response.status();
        let total = if status == StatusCode::PARTIAL_CONTENT {
            parse_content_range(&response).and_then(|(_, total)| total)
        } else {
            response.content_length()
        };
        ResumableBody {
            transport,
            url,
            response: Some(response),
            pending: None,
            offset: 0,
            total,
            status,
            stalls: 0,
            done: false,
        }
    }

    /// Status of the original response; resumes don't change it.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn transferred(&self) -> u64 {
        self.offset
    }

    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if self.transport.cancel().is_cancelled() {
                self.response = None;
                self.pending = None;
                return Err(Error::Canceled);
            }
            if self.done {
                return Ok(None);
            }
            if let Some(pending) = self.pending.take() {
                self.offset += pending.len() as u64;
                self.stalls = 0;
                return Ok(Some(pending));
            }
            let polled = match self.response.as_mut() {
                Some(response) => response.chunk().await,
                None => {
                    self.resume().await?;
                    continue;
                }
            };
            match polled {
                Ok(Some(chunk)) => {
                    self.offset += chunk.len() as u64;
                    self.stalls = 0;
                    return Ok(Some(chunk));
                }
                Ok(None) => match self.total {
                    // a clean close before the advertised end still resumes
                    Some(total) if self.offset < total => {
                        trace!(
                            "body ended at {} of {total}, resuming {}",
                            self.offset,
                            crate::transport::redact_url(&self.url)
                        );
                        self.response = None;
                    }
                    _ => {
                        self.done = true;
                        return Ok(None);
                    }
                },
                Err(e) => {
                    warn!(
                        "read failed at offset {}, resuming {}: {e}",
                        self.offset,
                        crate::transport::redact_url(&self.url)
                    );
                    self.response = None;
                }
            }
        }
    }

    async fn resume(&mut self) -> Result<(), Error> {
        if let Some(total) = self.total {
            if self.offset >= total {
                self.done = true;
                return Ok(());
            }
        }
        self.stalls += 1;
        if self.stalls > MAX_STALLS {
            return Err(Error::ResumeStalled(self.offset));
        }

        let req = self
            .transport
            .request(Method::GET, &self.url)
            .header(header::RANGE, format!("bytes={}-", self.offset));
        let res = self.transport.send(req).await?;

        match res.status() {
            StatusCode::PARTIAL_CONTENT => {
                let Some((start, total)) = parse_content_range(&res) else {
                    return Err(Error::ResumeOffsetMismatch {
                        want: self.offset,
                        got: 0,
                    });
                };
                if start != self.offset {
                    return Err(Error::ResumeOffsetMismatch {
                        want: self.offset,
                        got: start,
                    });
                }
                if self.total.is_none() {
                    self.total = total;
                }
                self.response = Some(res);
                Ok(())
            }
            StatusCode::OK => {
                // Range ignored: swallow the prefix we already handed out
                if self.offset > DISCARD_CAP {
                    return Err(Error::ResumeTooFar(self.offset));
                }
                let mut res = res;
                let mut remaining = self.offset;
                while remaining > 0 {
                    match res.chunk().await? {
                        Some(chunk) if (chunk.len() as u64) <= remaining => {
                            remaining -= chunk.len() as u64;
                        }
                        Some(chunk) => {
                            self.pending = Some(chunk.slice(remaining as usize..));
                            remaining = 0;
                        }
                        // the replacement body was shorter than the prefix;
                        // the stall counter bounds how often we tolerate it
                        None => return Ok(()),
                    }
                }
                self.response = Some(res);
                Ok(())
            }
            StatusCode::RANGE_NOT_SATISFIABLE => match parse_unsatisfied_total(&res) {
                Some(total) if self.offset >= total => {
                    self.done = true;
                    Ok(())
                }
                _ => Err(failure("GET", res).await),
            },
            _ => Err(failure("GET", res).await),
        }
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send {
        futures::stream::try_unfold(self, |mut body| async move {
            match body.chunk().await {
                Ok(Some(chunk)) => Ok(Some((chunk, body))),
                Ok(None) => Ok(None),
                Err(e) => Err(std::io::Error::other(e)),
            }
        })
    }

    pub fn into_async_read(self) -> impl tokio::io::AsyncRead + Send {
        StreamReader::new(self.into_stream())
    }
}
