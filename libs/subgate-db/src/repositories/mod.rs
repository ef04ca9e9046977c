pub mod account_repo;
pub mod entitlement_repo;
pub mod intent_repo;
pub mod payment_repo;
pub mod referral_repo;
pub mod trial_repo;

pub use account_repo::AccountRepository;
pub use entitlement_repo::EntitlementRepository;
pub use intent_repo::IntentRepository;
pub use payment_repo::PaymentRepository;
pub use referral_repo::ReferralRepository;
pub use trial_repo::TrialRepository;
