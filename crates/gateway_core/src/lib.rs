pub mod domain;
pub mod ports;

pub use domain::{
    AccessToken, ActiveDocument, AgreementModal, AuthSession, ClaimUpdate, ComplianceState,
    GuestUsage, LoginProof, Principal, QuotaGateState, Registration, ScrollPosition,
    SessionStatus, ToolOutput, ToolRequest, UploadFile, UsageCheck,
};
pub use ports::{
    AuthService, DocumentProcessor, GuestService, KeyValueStore, PersistenceLifetime, PortError,
    PortResult,
};
