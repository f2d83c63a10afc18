//! HTTP delegate fetcher built on a blocking reqwest client.
//!
//! Each fetch runs as one synchronous request on the injected executor, so
//! the pipeline never blocks the caller. The response body is handed to the
//! callback as a stream; the network producer pumps it.

use std::sync::Arc;

use pipeline_core::{Consumer, Executor, ExtraMap, ProducerContext};
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use reqwest::redirect::Policy;
use tracing::debug;

use crate::config::HttpFetcherConfig;
use crate::error::{FetchError, PipelineError};
use crate::image::EncodedImage;
use crate::network::{FetchCallback, FetchState, NetworkFetcher};

/// Maps a transport error onto the retry classifier's taxonomy.
fn map_reqwest_error(error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        return FetchError::timeout(error.to_string());
    }
    let message = error.to_string();
    if error.is_connect() {
        let lowered = message.to_ascii_lowercase();
        // DNS failures surface as connect errors; pull them apart so the
        // unknown-host retry flag applies to them.
        if lowered.contains("dns") || lowered.contains("resolve") {
            if let Some(host) = error.url().and_then(|url| url.host_str()) {
                return FetchError::unknown_host(host);
            }
            return FetchError::unknown_host(message);
        }
        return FetchError::connection(message);
    }
    if let Some(status) = error.status() {
        return FetchError::HttpStatus {
            status: status.as_u16(),
        };
    }
    FetchError::other(message)
}

pub struct HttpNetworkFetcher {
    client: Client,
    executor: Arc<dyn Executor>,
}

impl HttpNetworkFetcher {
    pub fn new(
        config: &HttpFetcherConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<HttpNetworkFetcher, PipelineError> {
        let redirect = if config.follow_redirects {
            Policy::default()
        } else {
            Policy::none()
        };
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .redirect(redirect)
            .build()
            .map_err(|e| PipelineError::configuration(e.to_string()))?;
        Ok(HttpNetworkFetcher { client, executor })
    }
}

impl NetworkFetcher for HttpNetworkFetcher {
    type State = FetchState;

    fn create_fetch_state(
        &self,
        consumer: Arc<dyn Consumer<EncodedImage>>,
        context: Arc<ProducerContext>,
    ) -> FetchState {
        FetchState::new(consumer, context)
    }

    fn fetch(&self, state: &Arc<FetchState>, callback: Arc<dyn FetchCallback>) {
        let client = self.client.clone();
        let state = state.clone();
        self.executor.execute(Box::new(move || {
            // Cancellation that happened while waiting for a thread.
            if state.context().is_cancelled() {
                callback.on_cancellation();
                return;
            }
            let mut request = client.get(state.uri().clone());
            if let Some(range) = state.context().request().bytes_range() {
                request = request.header(RANGE, range.to_http_range_header());
                *state.response_bytes_range.lock() = Some(range);
            }
            debug!(request_id = state.id(), uri = %state.uri(), "sending http request");
            let response = match request.send() {
                Ok(response) => response,
                Err(error) => {
                    callback.on_failure(map_reqwest_error(&error));
                    return;
                }
            };
            let status = response.status();
            if !status.is_success() {
                callback.on_failure(FetchError::HttpStatus {
                    status: status.as_u16(),
                });
                return;
            }
            let content_length = response.content_length();
            callback.on_response(Box::new(response), content_length);
        }));
    }

    fn extra_map(&self, state: &Arc<FetchState>, byte_size: usize) -> Option<ExtraMap> {
        let mut extras = ExtraMap::new();
        extras.insert("image_size".to_owned(), byte_size.to_string());
        extras.insert("uri".to_owned(), state.uri().to_string());
        Some(extras)
    }
}
