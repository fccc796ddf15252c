use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_std::sync::{Arc, Mutex};
use pin_project::pin_project;
use tokio::time::Sleep;
use tonic::codegen::http::Request;
use tower::{BoxError, Service};
use tracing::debug;

// Options used to control RPC failure injection.
#[derive(Debug, Clone)]
pub struct FailureOptions {
    // Probability with which intercepted RPCs fail.
    pub failure_probability: f64,

    // Probability with which to add latency to intercepted calls.
    pub latency_probability: f64,

    // How much latency to add for calls with additional latency.
    pub latency_ms: u64,

    // Members (by id) for which all incoming and outgoing RPCs fail.
    pub disconnected: HashSet<String>,
}

impl FailureOptions {
    // Returns failure injection options which don't add any failures.
    pub fn no_failures() -> Self {
        Self {
            failure_probability: 0.0,
            latency_probability: 0.0,
            latency_ms: 0,
            disconnected: HashSet::new(),
        }
    }

    // Returns failure injection options which fail RPCs with the supplied probability.
    pub fn fail_with_probability(failure_probability: f64) -> Self {
        Self {
            failure_probability,
            ..Self::no_failures()
        }
    }

    // Cuts the supplied member off from all its peers.
    #[cfg(test)]
    pub fn disconnect(&mut self, id: &str) {
        self.disconnected.insert(id.to_string());
    }

    #[cfg(test)]
    pub fn reconnect(&mut self, id: &str) {
        self.disconnected.remove(id);
    }

    // Decides whether a call along the supplied channel fails, and how much
    // latency it gets.
    fn decide(&self, channel_info: &ChannelInfo) -> (bool, Option<Duration>) {
        if self.disconnected.contains(&channel_info.src)
            || self.disconnected.contains(&channel_info.dst)
        {
            return (true, None);
        }
        if rand::random::<f64>() < self.failure_probability {
            return (true, None);
        }
        if rand::random::<f64>() < self.latency_probability {
            return (false, Some(Duration::from_millis(self.latency_ms)));
        }
        (false, None)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    src: String,
    dst: String,
}

impl ChannelInfo {
    pub fn new(src: String, dst: String) -> Self {
        Self { src, dst }
    }
}

// Tower middleware intended to wrap GRPC channels, capable of intercepting and injecting failures
// or additional latency into RPC calls. Failed calls never reach the inner service.
#[derive(Clone)]
pub struct FailureInjectionMiddleware<T> {
    inner: T,
    options: Arc<Mutex<FailureOptions>>,
    channel_info: ChannelInfo,
}

impl<T> FailureInjectionMiddleware<T> {
    pub fn new(inner: T, options: Arc<Mutex<FailureOptions>>, channel_info: ChannelInfo) -> Self {
        FailureInjectionMiddleware {
            inner,
            options,
            channel_info,
        }
    }
}

impl<T, ReqBody> Service<Request<ReqBody>> for FailureInjectionMiddleware<T>
where
    T: Service<Request<ReqBody>>,
    T::Error: Into<BoxError>,
{
    type Response = T::Response;
    type Error = BoxError;
    type Future = FailureInjectionFuture<T::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Never block the caller on the options, if someone is busy updating
        // them this call just goes through unharmed.
        let (failed, latency) = match self.options.try_lock() {
            Some(options) => options.decide(&self.channel_info),
            None => (false, None),
        };

        let inner = if failed {
            debug!(src = %self.channel_info.src, dst = %self.channel_info.dst, "injecting failure");
            None
        } else {
            Some(self.inner.call(request))
        };
        FailureInjectionFuture {
            inner,
            delay: latency.map(tokio::time::sleep),
            channel_info: self.channel_info.clone(),
        }
    }
}

// Special future that implements failure injection. Holds back the response of
// the underlying RPC to inject latency, and returns errors for failed calls.
#[pin_project]
pub struct FailureInjectionFuture<F> {
    #[pin]
    inner: Option<F>,
    #[pin]
    delay: Option<Sleep>,
    channel_info: ChannelInfo,
}

impl<F, Response, Error> Future for FailureInjectionFuture<F>
where
    F: Future<Output = Result<Response, Error>>,
    Error: Into<BoxError>,
{
    type Output = Result<Response, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        let inner = match this.inner.as_pin_mut() {
            Some(inner) => inner,
            None => {
                let error = tonic::Status::unavailable(format!(
                    "Failure injection in channel {} -> {}",
                    this.channel_info.src, this.channel_info.dst
                ));
                return Poll::Ready(Err(error.into()));
            }
        };

        if let Some(delay) = this.delay.as_mut().as_pin_mut() {
            match delay.poll(cx) {
                Poll::Ready(()) => this.delay.set(None),
                Poll::Pending => return Poll::Pending,
            }
        }

        match inner.poll(cx) {
            Poll::Ready(result) => Poll::Ready(result.map_err(Into::into)),
            Poll::Pending => Poll::Pending,
        }
    }
}
