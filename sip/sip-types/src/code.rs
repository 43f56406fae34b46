use std::fmt;

/// Classifies a [`StatusCode`] by its hundreds digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Provisional,
    Success,
    Redirect,
    RequestFailure,
    ServerFailure,
    GlobalFailure,
    Invalid,
}

/// A SIP response status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(u16);

macro_rules! status_codes {
    ($($code:literal, $text:literal, $konst:ident;)+) => {
        impl StatusCode {
            $(pub const $konst: StatusCode = StatusCode($code);)+

            /// The canonical reason phrase, if one is defined for this code
            pub fn text(&self) -> Option<&'static str> {
                match self.0 {
                    $($code => Some($text),)+
                    _ => None,
                }
            }
        }
    };
}

status_codes! {
    100, "Trying", TRYING;
    180, "Ringing", RINGING;
    181, "Call Is Being Forwarded", CALL_IS_BEING_FORWARDED;
    183, "Session Progress", SESSION_PROGRESS;
    200, "OK", OK;
    202, "Accepted", ACCEPTED;
    300, "Multiple Choices", MULTIPLE_CHOICES;
    301, "Moved Permanently", MOVED_PERMANENTLY;
    302, "Moved Temporarily", MOVED_TEMPORARILY;
    400, "Bad Request", BAD_REQUEST;
    401, "Unauthorized", UNAUTHORIZED;
    403, "Forbidden", FORBIDDEN;
    404, "Not Found", NOT_FOUND;
    405, "Method Not Allowed", METHOD_NOT_ALLOWED;
    407, "Proxy Authentication Required", PROXY_AUTHENTICATION_REQUIRED;
    408, "Request Timeout", REQUEST_TIMEOUT;
    410, "Gone", GONE;
    415, "Unsupported Media Type", UNSUPPORTED_MEDIA_TYPE;
    420, "Bad Extension", BAD_EXTENSION;
    423, "Interval Too Brief", INTERVAL_TOO_BRIEF;
    480, "Temporarily Unavailable", TEMPORARILY_UNAVAILABLE;
    481, "Call/Transaction Does Not Exist", CALL_OR_TRANSACTION_DOES_NOT_EXIST;
    482, "Loop Detected", LOOP_DETECTED;
    483, "Too Many Hops", TOO_MANY_HOPS;
    486, "Busy Here", BUSY_HERE;
    487, "Request Terminated", REQUEST_TERMINATED;
    488, "Not Acceptable Here", NOT_ACCEPTABLE_HERE;
    491, "Request Pending", REQUEST_PENDING;
    500, "Server Internal Error", SERVER_INTERNAL_ERROR;
    501, "Not Implemented", NOT_IMPLEMENTED;
    502, "Bad Gateway", BAD_GATEWAY;
    503, "Service Unavailable", SERVICE_UNAVAILABLE;
    504, "Server Time-out", SERVER_TIMEOUT;
    600, "Busy Everywhere", BUSY_EVERYWHERE;
    603, "Decline", DECLINE;
    604, "Does Not Exist Anywhere", DOES_NOT_EXIST_ANYWHERE;
}

impl StatusCode {
    pub fn kind(&self) -> CodeKind {
        match self.0 {
            100..=199 => CodeKind::Provisional,
            200..=299 => CodeKind::Success,
            300..=399 => CodeKind::Redirect,
            400..=499 => CodeKind::RequestFailure,
            500..=599 => CodeKind::ServerFailure,
            600..=699 => CodeKind::GlobalFailure,
            _ => CodeKind::Invalid,
        }
    }

    pub fn into_u16(self) -> u16 {
        self.0
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(StatusCode::TRYING.kind(), CodeKind::Provisional);
        assert_eq!(StatusCode::OK.kind(), CodeKind::Success);
        assert_eq!(StatusCode::BUSY_HERE.kind(), CodeKind::RequestFailure);
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE.kind(), CodeKind::ServerFailure);
        assert_eq!(StatusCode::DECLINE.kind(), CodeKind::GlobalFailure);
    }

    #[test]
    fn reason_text() {
        assert_eq!(StatusCode::BUSY_HERE.text(), Some("Busy Here"));
        assert_eq!(StatusCode::from(499).text(), None);
    }
}
