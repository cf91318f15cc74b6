use crate::errors::JobFailure;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, SentryFutureExt, TransactionContext};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

/// Run `callback` inside a Sentry performance transaction named after the job type.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let hub = Arc::new(Hub::new_from_top(Hub::current()));
    let tx_ctx = TransactionContext::new(transaction_name, "pgjobs.perform");
    let tx = hub.start_transaction(tx_ctx);
    hub.configure_scope(|scope| scope.set_span(Some(tx.clone().into())));

    let result = callback().bind_hub(hub).await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

/// Turn a panic payload caught with `catch_unwind` into a job failure.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> JobFailure {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        JobFailure::Panicked((*message).to_string())
    } else if let Some(message) = info.downcast_ref::<String>() {
        JobFailure::Panicked(message.clone())
    } else {
        JobFailure::Panicked("<non-string panic payload>".to_string())
    }
}
