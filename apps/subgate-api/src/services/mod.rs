pub mod monitoring;
pub mod notification_service;
pub mod referral_service;
pub mod subscription_service;
