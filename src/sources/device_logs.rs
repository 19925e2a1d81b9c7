use std::time::Duration;

use time::OffsetDateTime;

use crate::{
    api::{DeviceLogsApi, LogRecord, LogsPage, LogsQuery, POWER_CODE},
    domain::PowerSample,
    pipeline::{CollectorError, Envelope, ItemStream, Source},
};

/// Paginated source of power readings for a single device.
///
/// Walks the device log endpoint page by page, threading the continuation
/// row key the server hands back until it reports no further pages. Records
/// whose status code is not `cur_power` are discarded; the rest are yielded
/// as `PowerSample`s in server order. `max_pages` bounds runaway pagination.
pub struct DeviceLogSource<C> {
    api: C,
    device_id: String,
    query: LogsQuery,
    max_pages: u32,
    max_retries: u32,
    retry_backoff: Duration,
}

impl<C> DeviceLogSource<C> {
    pub fn new(
        api: C,
        device_id: impl Into<String>,
        query: LogsQuery,
        max_pages: u32,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            api,
            device_id: device_id.into(),
            query,
            max_pages,
            max_retries,
            retry_backoff,
        }
    }
}

fn to_power_sample(record: &LogRecord) -> Result<PowerSample, CollectorError> {
    let centiwatts = record.value.as_int().ok_or_else(|| {
        CollectorError::MalformedResponse(format!(
            "non-numeric value {:?} for '{}' at event_time {}",
            record.value, record.code, record.event_time
        ))
    })?;
    let ts = OffsetDateTime::from_unix_timestamp_nanos(record.event_time as i128 * 1_000_000)
        .map_err(|e| {
            CollectorError::MalformedResponse(format!(
                "event_time {} out of range: {e}",
                record.event_time
            ))
        })?;
    Ok(PowerSample {
        ts,
        watts: centiwatts as f64 / 100.0,
    })
}

async fn fetch_page<C: DeviceLogsApi>(
    api: &C,
    device_id: &str,
    query: &LogsQuery,
    max_retries: u32,
    retry_backoff: Duration,
) -> Result<LogsPage, CollectorError> {
    let mut attempt: u32 = 0;
    loop {
        match api.device_logs(device_id, query).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                metrics::counter!("device_log_fetch_retries_total").increment(1);
                tracing::warn!(error = %e, attempt, "log page fetch failed, retrying");
                tokio::time::sleep(retry_backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait::async_trait]
impl<C> Source<PowerSample> for DeviceLogSource<C>
where
    C: DeviceLogsApi + Clone + Send + Sync + 'static,
{
    async fn stream(&self) -> ItemStream<PowerSample> {
        let api = self.api.clone();
        let device_id = self.device_id.clone();
        let mut query = self.query.clone();
        let max_pages = self.max_pages;
        let max_retries = self.max_retries;
        let retry_backoff = self.retry_backoff;

        let s = async_stream::try_stream! {
            let mut pages: u32 = 0;
            loop {
                let page = if pages >= max_pages {
                    Err(CollectorError::PaginationLimitExceeded { pages })
                } else {
                    fetch_page(&api, &device_id, &query, max_retries, retry_backoff).await
                }?;
                pages += 1;
                metrics::counter!("device_log_pages_fetched_total").increment(1);

                for record in &page.logs {
                    if record.code != POWER_CODE {
                        metrics::counter!("device_log_records_discarded_total").increment(1);
                        continue;
                    }
                    let sample = to_power_sample(record)?;
                    yield Envelope::now(sample);
                }

                if !page.has_next {
                    break;
                }
                match page.next_row_key {
                    Some(key) => query.start_row_key = Some(key),
                    None => Err(CollectorError::MalformedResponse(
                        "server reported another page but sent no next_row_key".to_string(),
                    ))?,
                }
            }
            tracing::debug!(pages, "device log pagination finished");
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RawValue;
    use futures::StreamExt;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };
    use time::macros::datetime;

    #[derive(Clone, Default)]
    struct ScriptedApi {
        pages: Arc<Mutex<VecDeque<Result<LogsPage, CollectorError>>>>,
        requests: Arc<Mutex<Vec<LogsQuery>>>,
    }

    impl ScriptedApi {
        fn push(&self, page: Result<LogsPage, CollectorError>) {
            self.pages.lock().unwrap().push_back(page);
        }

        fn recorded(&self) -> Vec<LogsQuery> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl DeviceLogsApi for ScriptedApi {
        async fn device_logs(
            &self,
            _device_id: &str,
            query: &LogsQuery,
        ) -> Result<LogsPage, CollectorError> {
            self.requests.lock().unwrap().push(query.clone());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(page(vec![], None)))
        }
    }

    fn power(event_time: i64, value: &str) -> LogRecord {
        record(event_time, POWER_CODE, value)
    }

    fn record(event_time: i64, code: &str, value: &str) -> LogRecord {
        LogRecord {
            event_time,
            code: code.to_string(),
            value: RawValue::Text(value.to_string()),
        }
    }

    fn page(logs: Vec<LogRecord>, next: Option<&str>) -> LogsPage {
        LogsPage {
            logs,
            has_next: next.is_some(),
            next_row_key: next.map(str::to_string),
        }
    }

    fn source(api: ScriptedApi, max_pages: u32) -> DeviceLogSource<ScriptedApi> {
        DeviceLogSource::new(
            api,
            "dev-1",
            LogsQuery::for_window(
                datetime!(2023-10-02 19:00:00 UTC),
                datetime!(2023-10-02 21:55:00 UTC),
                1000,
            ),
            max_pages,
            1,
            Duration::from_millis(1),
        )
    }

    async fn collect(
        src: &DeviceLogSource<ScriptedApi>,
    ) -> Vec<Result<Envelope<PowerSample>, CollectorError>> {
        src.stream().await.collect().await
    }

    #[tokio::test]
    async fn concatenates_pages_until_has_next_clears() {
        let api = ScriptedApi::default();
        api.push(Ok(page(vec![power(1_696_273_200_000, "35210")], Some("row-2"))));
        api.push(Ok(page(vec![power(1_696_273_260_000, "20000")], Some("row-3"))));
        api.push(Ok(page(vec![power(1_696_273_320_000, "30000")], None)));

        let items = collect(&source(api.clone(), 100)).await;
        let samples: Vec<PowerSample> = items.into_iter().map(|r| r.unwrap().payload).collect();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].ts, datetime!(2023-10-02 19:00:00 UTC));
        assert_eq!(samples[0].watts, 352.1);
        assert_eq!(samples[2].watts, 300.0);
        assert_eq!(api.recorded().len(), 3);
    }

    #[tokio::test]
    async fn threads_row_key_between_requests() {
        let api = ScriptedApi::default();
        api.push(Ok(page(vec![power(1_000, "100")], Some("row-2"))));
        api.push(Ok(page(vec![power(2_000, "100")], Some("row-3"))));
        api.push(Ok(page(vec![power(3_000, "100")], None)));

        collect(&source(api.clone(), 100)).await;
        let reqs = api.recorded();
        assert_eq!(reqs[0].start_row_key, None);
        assert_eq!(reqs[1].start_row_key.as_deref(), Some("row-2"));
        assert_eq!(reqs[2].start_row_key.as_deref(), Some("row-3"));
        assert!(reqs
            .iter()
            .all(|q| q.start_time == reqs[0].start_time && q.end_time == reqs[0].end_time));
    }

    #[tokio::test]
    async fn discards_records_for_other_codes() {
        let api = ScriptedApi::default();
        api.push(Ok(page(
            vec![
                record(1_000, "switch_1", "true"),
                power(2_000, "5000"),
                record(3_000, "add_ele", "12"),
            ],
            None,
        )));

        let items = collect(&source(api.clone(), 100)).await;
        let samples: Vec<PowerSample> = items.into_iter().map(|r| r.unwrap().payload).collect();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].watts, 50.0);
    }

    #[tokio::test]
    async fn page_cap_aborts_runaway_pagination() {
        let api = ScriptedApi::default();
        for i in 0..5 {
            api.push(Ok(page(vec![power(i * 1_000, "100")], Some("next"))));
        }

        let items = collect(&source(api.clone(), 3)).await;
        assert_eq!(api.recorded().len(), 3);
        assert_eq!(items.len(), 4);
        assert!(matches!(
            items.last(),
            Some(Err(CollectorError::PaginationLimitExceeded { pages: 3 }))
        ));
    }

    #[tokio::test]
    async fn missing_row_key_with_more_pages_is_malformed() {
        let api = ScriptedApi::default();
        api.push(Ok(LogsPage {
            logs: vec![power(1_000, "100")],
            has_next: true,
            next_row_key: None,
        }));

        let items = collect(&source(api.clone(), 100)).await;
        assert!(matches!(
            items.last(),
            Some(Err(CollectorError::MalformedResponse(_)))
        ));
        assert_eq!(api.recorded().len(), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let api = ScriptedApi::default();
        api.push(Err(CollectorError::TransientFetch("503".to_string())));
        api.push(Ok(page(vec![power(1_000, "100")], None)));

        let items = collect(&source(api.clone(), 100)).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
        assert_eq!(api.recorded().len(), 2);
    }

    #[tokio::test]
    async fn retries_exhausted_propagates_transient_error() {
        let api = ScriptedApi::default();
        for _ in 0..3 {
            api.push(Err(CollectorError::TransientFetch("503".to_string())));
        }

        let items = collect(&source(api.clone(), 100)).await;
        assert_eq!(api.recorded().len(), 2);
        assert!(matches!(
            items.last(),
            Some(Err(CollectorError::TransientFetch(_)))
        ));
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let api = ScriptedApi::default();
        api.push(Err(CollectorError::Auth("bad token".to_string())));
        api.push(Ok(page(vec![power(1_000, "100")], None)));

        let items = collect(&source(api.clone(), 100)).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items.last(), Some(Err(CollectorError::Auth(_)))));
        assert_eq!(api.recorded().len(), 1);
    }

    #[tokio::test]
    async fn non_numeric_power_value_aborts_with_context() {
        let api = ScriptedApi::default();
        api.push(Ok(page(vec![power(1_000, "on")], None)));

        let items = collect(&source(api.clone(), 100)).await;
        match items.last() {
            Some(Err(CollectorError::MalformedResponse(msg))) => {
                assert!(msg.contains("event_time 1000"));
            }
            other => panic!("expected malformed response, got {other:?}"),
        }
    }
}
