pub mod bearer;

pub use bearer::{
    authorize, bearer_credentials, AuthDecision, AuthRejection, Authorized, BearerSecret,
};
