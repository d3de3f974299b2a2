mod api;

pub use api::{
    EchoRequest, EchoResponse, HealthResponse, LimitedResponse, MAX_ECHO_MESSAGE_LENGTH,
    MAX_ECHO_TAGS, SlowParams, SlowResponse,
};
