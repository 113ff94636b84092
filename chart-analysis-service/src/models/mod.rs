pub mod registration_key;
pub mod session;

pub use registration_key::{
    generate_key, normalize_key, plan_redemption, KeyFilter, KeyStats, KeyStatus, NewKeyBatch,
    RedeemError, Redemption, RegistrationKey, Subscription, MAX_DURATION_DAYS,
};
pub use session::{AnalysisAction, AnalysisStage, ChartRecord, TransitionError, UserSession};
