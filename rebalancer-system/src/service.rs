use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A message interface for [services](Service).
///
/// Most commonly, this is an enumeration of messages, but it can be any type that implements
/// [`FromMessage`] for all messages it accepts. Services without messages use `()`.
pub trait Interface: Send + 'static {}

/// Services without messages can use `()` as their interface.
impl Interface for () {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send message to service")
    }
}

impl std::error::Error for SendError {}

/// Response behavior of an [`Interface`] message.
///
/// It defines how a service handles and responds to messages, such as through
/// [`NoResponse`] or [`AsyncResponse`].
pub trait MessageResponse {
    /// Sends responses from the service back to the waiting recipient.
    type Sender;

    /// The type returned from [`Addr::send`].
    type Output;

    /// Returns the response channel for an interface message.
    fn channel() -> (Self::Sender, Self::Output);
}

/// The request when sending a message without a response.
#[derive(Debug)]
pub struct NoResponse;

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// The response of a message that is handled asynchronously.
///
/// Resolves to [`SendError`] if the service drops the [`Sender`] without responding.
#[derive(Debug)]
pub struct Request<T>(oneshot::Receiver<T>);

impl<T> Future for Request<T> {
    type Output = Result<T, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx).map(|r| r.map_err(|_| SendError))
    }
}

/// Sends a message response from a service back to the waiting [`Request`].
#[derive(Debug)]
pub struct Sender<T>(oneshot::Sender<T>);

impl<T> Sender<T> {
    /// Sends the response value and closes the [`Request`].
    ///
    /// If the requester has gone away, the value is dropped.
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }
}

/// Message response resulting in an asynchronous [`Request`].
#[derive(Debug)]
pub struct AsyncResponse<T>(std::marker::PhantomData<T>);

impl<T> MessageResponse for AsyncResponse<T> {
    type Sender = Sender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (Sender(tx), Request(rx))
    }
}

/// Declares a message as part of an [`Interface`].
pub trait FromMessage<M>: Interface {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// The address of a [`Service`].
///
/// Addresses allow to [send](Self::send) messages to a service that implements a corresponding
/// [`Interface`] as long as the service is running. They can be freely cloned.
pub struct Addr<I: Interface> {
    tx: mpsc::UnboundedSender<I>,
    name: &'static str,
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service and returns the response.
    ///
    /// Depending on the message's response behavior, this returns a future or the immediate
    /// response. Messages to a service that has shut down are dropped.
    pub fn send<M>(&self, message: M) -> <I::Response as MessageResponse>::Output
    where
        I: FromMessage<M>,
    {
        let (tx, rx) = I::Response::channel();
        if self.tx.send(I::from_message(message, tx)).is_err() {
            rebalancer_log::debug!(service = self.name, "dropped message to stopped service");
        }
        rx
    }

    /// Returns `true` if the service has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// Manually implemented since we do not require `I: Clone`.
impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            name: self.name,
        }
    }
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr").field("name", &self.name).finish()
    }
}

/// Inbound channel for messages sent through an [`Addr`].
pub struct Receiver<I: Interface> {
    rx: mpsc::UnboundedReceiver<I>,
    name: &'static str,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next value for this receiver.
    ///
    /// Returns `None` once all addresses have been dropped.
    pub async fn recv(&mut self) -> Option<I> {
        self.rx.recv().await
    }

    /// Returns the name of the service owning this receiver.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").field("name", &self.name).finish()
    }
}

/// Creates an unbounded channel for communicating with a [`Service`].
pub fn channel<I: Interface>(name: &'static str) -> (Addr<I>, Receiver<I>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Addr { tx, name }, Receiver { rx, name })
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to some [`Interface`] through an [`Addr`] and handle
/// them one by one. Internally, services are free to concurrently process these messages or
/// not, most probably should.
pub trait Service: Sized + Send + 'static {
    /// The interface of messages this service implements.
    type Interface: Interface;

    /// Runs the service until its receiver is closed or it decides to stop.
    fn run(self, rx: Receiver<Self::Interface>) -> impl Future<Output = ()> + Send + 'static;

    /// Returns the name of this service, used in logs.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Starts the service on the current tokio runtime and returns its address.
    fn start_detached(self) -> Addr<Self::Interface> {
        let (addr, rx) = channel(Self::name());
        tokio::spawn(self.run(rx));
        addr
    }
}

/// Starts services and keeps track of them until they finish.
#[derive(Debug, Default)]
pub struct ServiceRunner(FuturesUnordered<JoinHandle<()>>);

impl ServiceRunner {
    /// Creates an empty runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a service on the current tokio runtime and returns its address.
    pub fn start<S: Service>(&mut self, service: S) -> Addr<S::Interface> {
        let (addr, rx) = channel(S::name());
        self.0.push(tokio::spawn(service.run(rx)));
        addr
    }

    /// Waits until all started services have finished.
    pub async fn join(&mut self) {
        while let Some(result) = self.0.next().await {
            if let Err(error) = result {
                rebalancer_log::error!(
                    error = &error as &dyn std::error::Error,
                    "service terminated unexpectedly"
                );
            }
        }
    }
}
