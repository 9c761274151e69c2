pub mod api_router;
pub mod booking;
pub mod bridge;
pub mod config;
pub mod crm;
pub mod followup;
pub mod inbound;
pub mod llm;
pub mod notify;
pub mod outbound;
pub mod postcall;
pub mod reps;
pub mod shared;
pub mod slots;
pub mod telephony;
pub mod timeloc;
pub mod voiceai;
