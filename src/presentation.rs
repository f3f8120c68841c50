use crate::classifier::EventClassifier;
use crate::config::Settings;
use crate::device::{DeviceApi, Pose};
use crate::models::{Classified, InboundEvent};
use crate::mqtt_service::{ConnectionParams, MessageBridge};
use crate::sequencer::{panic_message, ActSequencer, SequenceReport};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Applies one inbound message to the device: window transitions become
/// events, everything else is stored under its full topic.
pub fn dispatch_inbound<D: DeviceApi + ?Sized>(
    classifier: &EventClassifier,
    device: &D,
    event: &InboundEvent,
) {
    match classifier.classify(&event.topic, &event.payload) {
        Some(Classified::State(state)) => {
            info!("{} reported {:?}", state.subject, state.kind);
            if let Err(e) = device.raise_event(state.kind.event_name(), &state.subject) {
                error!("Failed to raise {} for {}: {}", state.kind.event_name(), state.subject, e);
            }
        }
        Some(Classified::Raw(raw)) => {
            debug!("Storing {} = {}", raw.item, raw.value);
            if let Err(e) = device.insert_value(&event.topic, &raw.value) {
                error!("Failed to store value for '{}': {}", event.topic, e);
            }
        }
        None => debug!("Ignoring '{}' on '{}'", event.payload, event.topic),
    }
}

pub fn spawn_inbound_listener<D: DeviceApi + 'static>(
    mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
    classifier: EventClassifier,
    device: Arc<D>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = inbound.recv().await {
            dispatch_inbound(&classifier, device.as_ref(), &event);
        }
        debug!("Inbound channel closed, listener finished.");
    })
}

/// Owns the broker session and the device for the lifetime of the show.
pub struct Presentation<D: DeviceApi + 'static> {
    pub(crate) settings: Arc<Settings>,
    pub(crate) bridge: MessageBridge,
    pub(crate) device: Arc<D>,
    inbound: Option<mpsc::UnboundedReceiver<InboundEvent>>,
    listener: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl<D: DeviceApi + 'static> Presentation<D> {
    pub fn new(settings: Arc<Settings>, device: Arc<D>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = MessageBridge::new(ConnectionParams::derive(&settings.broker), tx);
        Self {
            settings,
            bridge,
            device,
            inbound: Some(rx),
            listener: None,
            shut_down: false,
        }
    }

    pub fn bridge(&self) -> &MessageBridge {
        &self.bridge
    }

    /// Runs the whole presentation. Anything escaping the act boundaries is
    /// logged here; the caller still owes a [`Presentation::shutdown`].
    pub async fn start(&mut self) -> Option<SequenceReport> {
        match AssertUnwindSafe(self.present()).catch_unwind().await {
            Ok(report) => Some(report),
            Err(panic) => {
                error!("Presentation aborted: {}", panic_message(panic.as_ref()));
                None
            }
        }
    }

    async fn present(&mut self) -> SequenceReport {
        if let Some(inbound) = self.inbound.take() {
            let classifier = EventClassifier::from_topics(&self.settings.topics);
            self.listener = Some(spawn_inbound_listener(inbound, classifier, self.device.clone()));
        }

        if let Err(e) = self.bridge.connect().await {
            error!("Continuing without broker connection: {}", e);
        }

        if let Err(e) = self.device.prepare(&self.settings.app.config.language) {
            error!("Device preparation failed: {}", e);
        }

        info!("Presentation starting.");
        self.put_head_up();

        let mut sequencer = ActSequencer::new(self.settings.app.functions);
        let report = sequencer.run(self).await;
        info!("Presentation finished after {} act(s).", report.outcomes.len());
        report
    }

    /// Reset gesture. Failures are logged and swallowed.
    pub(crate) fn put_head_up(&self) {
        if let Err(e) = self.device.move_to(Pose::HEAD_UP) {
            error!("Failed to raise head: {}", e);
        }
    }

    /// Disconnects the broker and stops the device. Only the first call has an effect.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            debug!("Shutdown already done.");
            return;
        }
        self.shut_down = true;

        info!("Shutting down presentation...");
        self.bridge.disconnect().await;
        self.device.stop();

        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}
