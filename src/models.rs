use std::fmt;

/// The fixed presentation catalog, in running order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Act {
    Welcome,
    Music,
    Alexa,
    RollerShutter,
    CarDrivingTraining,
    Kitchen,
    Farewell,
}

impl Act {
    pub const CATALOG: [Act; 7] = [
        Act::Welcome,
        Act::Music,
        Act::Alexa,
        Act::RollerShutter,
        Act::CarDrivingTraining,
        Act::Kitchen,
        Act::Farewell,
    ];

    /// Act that closes the show on its own; when enabled no finalization runs.
    pub const CLOSING: Act = Act::Farewell;

    pub fn key(self) -> &'static str {
        match self {
            Act::Welcome => "WELCOME",
            Act::Music => "MUSIC",
            Act::Alexa => "ALEXA",
            Act::RollerShutter => "ROLLER_SHUTTER",
            Act::CarDrivingTraining => "CAR_DRIVING_TRAINING",
            Act::Kitchen => "KITCHEN",
            Act::Farewell => "FAREWELL",
        }
    }
}

impl fmt::Display for Act {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A message delivered by the broker, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Opened,
    Closed,
}

impl StateKind {
    /// Event name raised on the robot.
    pub fn event_name(self) -> &'static str {
        match self {
            StateKind::Opened => "WindowOpend",
            StateKind::Closed => "WindowClosed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEvent {
    pub kind: StateKind,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue {
    pub item: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    State(StateEvent),
    Raw(RawValue),
}
