//! Event types and subscribers shared by the integration tests.

use async_event_bus::{
    DeadEvent, EventSubscriber, EventType, HandlerSet, Lineage, SubscriberException,
    SubscriberExceptionHandler, ThreadAffinity,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use super::thread_name;

/// Address of a value, for identity checks.
pub fn address_of<T: ?Sized>(value: &T) -> usize {
    value as *const T as *const () as usize
}

pub struct OrderPlaced {
    pub id: Uuid,
    pub sequence: usize,
}

impl OrderPlaced {
    pub fn new() -> Self {
        Self::numbered(0)
    }

    pub fn numbered(sequence: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
        }
    }
}

impl Default for OrderPlaced {
    fn default() -> Self {
        Self::new()
    }
}

impl EventType for OrderPlaced {}

pub trait Auditable: Send + Sync {
    fn audit_id(&self) -> Uuid;
}

impl EventType for dyn Auditable {}

pub struct PaymentCaptured {
    pub id: Uuid,
}

impl PaymentCaptured {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for PaymentCaptured {
    fn default() -> Self {
        Self::new()
    }
}

impl Auditable for PaymentCaptured {
    fn audit_id(&self) -> Uuid {
        self.id
    }
}

impl EventType for PaymentCaptured {
    fn lineage(lineage: &mut Lineage<Self>) {
        lineage.implements::<dyn Auditable>(|payment| payment);
    }
}

/// An order event that is also routable as [`OrderPlaced`].
pub struct ExpressOrderPlaced {
    pub order: OrderPlaced,
}

impl ExpressOrderPlaced {
    pub fn new() -> Self {
        Self {
            order: OrderPlaced::new(),
        }
    }
}

impl Default for ExpressOrderPlaced {
    fn default() -> Self {
        Self::new()
    }
}

impl EventType for ExpressOrderPlaced {
    fn lineage(lineage: &mut Lineage<Self>) {
        lineage.extends::<OrderPlaced>(|express| &express.order);
    }
}

/// Not handled by any fixture subscriber except through dead events.
pub struct InventoryCounted;

impl EventType for InventoryCounted {}

/// What one handler observed: event address, event id and the thread it ran on.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub address: usize,
    pub id: Uuid,
    pub thread: String,
}

impl Observation {
    pub fn of<T: ?Sized>(event: &T, id: Uuid) -> Self {
        Self {
            address: address_of(event),
            id,
            thread: thread_name(),
        }
    }
}

/// Handles orders, audits and express orders with `CallerThread` affinity.
#[derive(Default)]
pub struct OrderDesk {
    pub last_order: Mutex<Option<Observation>>,
    pub last_audit: Mutex<Option<Observation>>,
    pub last_express: Mutex<Option<Observation>>,
    pub deliveries: AtomicUsize,
}

impl OrderDesk {
    fn on_order(&self, event: &OrderPlaced) {
        *self.last_order.lock() = Some(Observation::of(event, event.id));
        self.deliveries.fetch_add(1, Ordering::SeqCst);
    }

    fn on_audit(&self, event: &dyn Auditable) {
        *self.last_audit.lock() = Some(Observation::of(event, event.audit_id()));
        self.deliveries.fetch_add(1, Ordering::SeqCst);
    }

    fn on_express(&self, event: &ExpressOrderPlaced) {
        *self.last_express.lock() = Some(Observation::of(event, event.order.id));
        self.deliveries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

impl EventSubscriber for OrderDesk {
    fn declare_handlers(handlers: &mut HandlerSet<Self>) {
        handlers
            .on_thread::<OrderPlaced, _>("on_order", ThreadAffinity::CallerThread, Self::on_order)
            .on_thread::<dyn Auditable, _>("on_audit", ThreadAffinity::CallerThread, |desk, event| {
                desk.on_audit(event)
            })
            .on_thread::<ExpressOrderPlaced, _>(
                "on_express",
                ThreadAffinity::CallerThread,
                Self::on_express,
            );
    }
}

/// Records `OrderPlaced` sequences and threads for one affinity.
pub struct SequenceRecorder<const AFFINITY: u8> {
    pub sequences: Mutex<Vec<usize>>,
    pub threads: Mutex<Vec<String>>,
}

impl<const AFFINITY: u8> Default for SequenceRecorder<AFFINITY> {
    fn default() -> Self {
        Self {
            sequences: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
        }
    }
}

impl<const AFFINITY: u8> SequenceRecorder<AFFINITY> {
    pub fn len(&self) -> usize {
        self.sequences.lock().len()
    }

    pub fn last_thread(&self) -> Option<String> {
        self.threads.lock().last().cloned()
    }

    fn record(&self, event: &OrderPlaced) {
        self.sequences.lock().push(event.sequence);
        self.threads.lock().push(thread_name());
    }
}

pub const CALLER: u8 = 0;
pub const DISPATCH: u8 = 1;
pub const BACKGROUND: u8 = 2;
pub const MAIN: u8 = 3;
pub const AS_REGISTERED: u8 = 4;

pub fn affinity_of(code: u8) -> ThreadAffinity {
    match code {
        CALLER => ThreadAffinity::CallerThread,
        DISPATCH => ThreadAffinity::DispatchThread,
        BACKGROUND => ThreadAffinity::Background,
        MAIN => ThreadAffinity::Main,
        _ => ThreadAffinity::AsRegistered,
    }
}

impl<const AFFINITY: u8> EventSubscriber for SequenceRecorder<AFFINITY> {
    fn declare_handlers(handlers: &mut HandlerSet<Self>) {
        handlers.on_thread::<OrderPlaced, _>("record", affinity_of(AFFINITY), Self::record);
    }
}

pub type CallerRecorder = SequenceRecorder<CALLER>;
pub type DispatchRecorder = SequenceRecorder<DISPATCH>;
pub type BackgroundRecorder = SequenceRecorder<BACKGROUND>;
pub type MainRecorder = SequenceRecorder<MAIN>;
pub type RegisteredRecorder = SequenceRecorder<AS_REGISTERED>;

/// Collects dead events.
#[derive(Default)]
pub struct DeadLetterBox {
    pub letters: Mutex<Vec<DeadLetter>>,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event_address: usize,
    pub event_type: &'static str,
    pub source: async_event_bus::EventBus,
}

impl DeadLetterBox {
    fn on_dead(&self, dead: &DeadEvent) {
        self.letters.lock().push(DeadLetter {
            event_address: address_of(dead.event()),
            event_type: dead.event_type().name(),
            source: dead.source().clone(),
        });
    }

    pub fn count(&self) -> usize {
        self.letters.lock().len()
    }
}

impl EventSubscriber for DeadLetterBox {
    fn declare_handlers(handlers: &mut HandlerSet<Self>) {
        handlers.on_thread::<DeadEvent, _>("on_dead", ThreadAffinity::CallerThread, Self::on_dead);
    }
}

/// Handler bodies that fail in the two possible ways.
#[derive(Default)]
pub struct FaultyClerk {
    pub attempts: AtomicUsize,
}

impl EventSubscriber for FaultyClerk {
    fn declare_handlers(handlers: &mut HandlerSet<Self>) {
        handlers
            .on_thread::<OrderPlaced, _>("reject_order", ThreadAffinity::CallerThread, |clerk, _| {
                clerk.attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("order rejected")
            })
            .on_thread::<PaymentCaptured, ()>("crash_on_payment", ThreadAffinity::CallerThread, |clerk, _| {
                clerk.attempts.fetch_add(1, Ordering::SeqCst);
                panic!("payment ledger unavailable");
            });
    }
}

/// Exception hook that records what it receives.
#[derive(Default)]
pub struct RecordingExceptionHandler {
    pub reports: Mutex<Vec<Report>>,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub handler: &'static str,
    pub event_type: &'static str,
    pub message: String,
    pub panicked: bool,
    pub target_alive: bool,
}

impl RecordingExceptionHandler {
    pub fn count(&self) -> usize {
        self.reports.lock().len()
    }
}

impl SubscriberExceptionHandler for RecordingExceptionHandler {
    fn on_subscriber_exception(&self, exception: &SubscriberException<'_>) {
        self.reports.lock().push(Report {
            handler: exception.handler().name(),
            event_type: exception.handler().event_type().name(),
            message: match exception.error().source_error() {
                Some(source) => source.to_string(),
                None => exception.error().to_string(),
            },
            panicked: matches!(exception.error(), async_event_bus::HandlerError::Panicked(_)),
            target_alive: exception.target().is_some() && exception.target_as::<FaultyClerk>().is_some(),
        });
    }
}
