use std::time::Duration;

use async_trait::async_trait;
use retask::prelude::*;

/// Sleeps for `args[0]` seconds. Useful to watch timeouts kill a handler.
struct Sleep;

#[async_trait]
impl Handler for Sleep {
    async fn handle(&self, arguments: Arguments) -> Result<(), HandlerError> {
        let seconds = arguments
            .args
            .first()
            .and_then(|value| value.as_u64())
            .ok_or_else(|| HandlerError::new("sleep expects a number of seconds"))?;
        tracing::info!("Sleeping for {seconds} seconds");
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(())
    }
}

pub fn registry() -> Registry {
    Registry::builder()
        .register_fn("add", |arguments: Arguments| async move {
            let numbers: Vec<i64> = arguments
                .args
                .iter()
                .map(|value| value.as_i64().ok_or("add only accepts integers"))
                .collect::<Result<_, _>>()
                .map_err(HandlerError::new)?;
            tracing::info!("{numbers:?} add up to {}", numbers.iter().sum::<i64>());
            Ok(())
        })
        .register_fn("report", |arguments: Arguments| async move {
            let format = arguments
                .kwargs
                .get("format")
                .and_then(|value| value.as_str())
                .unwrap_or("txt");
            tracing::info!("Generating {format} report for {:?}", arguments.kwargs.get("recipients"));
            Ok(())
        })
        .register_fn("cleanup", |arguments: Arguments| async move {
            let days = arguments.args.first().and_then(|value| value.as_u64()).unwrap_or(7);
            tracing::info!("Removing sessions older than {days} days");
            Ok(())
        })
        .register_fn("fail", |_| async {
            Err(HandlerError::new("this handler always fails"))
        })
        .register("sleep", Sleep)
        .build()
}
