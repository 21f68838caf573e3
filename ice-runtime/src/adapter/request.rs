//! Incoming requests and the replies produced for them.

use std::sync::Arc;

use bytes::Bytes;
use ice_core::protocol::{EncodingVersion, OperationMode, ReplyStatus};
use ice_core::{Context, IceError, Identity, InputStream, OutputStream, Result};

use crate::connection::Connection;

/// A request read off the wire, or handed over by a collocated invocation.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Zero for oneway and batch requests.
    pub request_id: i32,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    /// Encoding of the parameter encapsulation.
    pub encoding: EncodingVersion,
    /// Marshaled parameters, without the encapsulation header.
    pub params: Bytes,
    /// Size of the request on the wire.
    pub size: usize,
}

impl IncomingRequest {
    /// Reads the request that follows the request id.
    pub fn read(is: &mut InputStream, request_id: i32, size: usize) -> Result<Self> {
        let identity: Identity = is.read()?;
        let facet = match is.read_string_seq()?.as_slice() {
            [] => String::new(),
            [facet] => facet.clone(),
            _ => return Err(IceError::marshal("facet sequence with more than one element")),
        };
        let operation = is.read_string()?;
        let mode = OperationMode::try_from(is.read_u8()?)?;
        let context = is.read_context()?;
        let (encoding, params) = is.read_encapsulation()?;
        Ok(Self {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
            encoding,
            params,
            size,
        })
    }

    /// Returns a stream over the parameters.
    pub fn input(&self) -> InputStream {
        InputStream::with_encoding(self.params.clone(), self.encoding)
    }

    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }
}

/// Reads every request of a batch request message body.
pub fn read_batch(is: &mut InputStream) -> Result<Vec<IncomingRequest>> {
    let count = is.read_i32()?;
    if count < 0 {
        return Err(IceError::marshal(format!("negative batch request count {count}")));
    }
    let mut requests = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let start = is.pos();
        let mut request = IncomingRequest::read(is, 0, 0)?;
        request.size = is.pos() - start;
        requests.push(request);
    }
    Ok(requests)
}

/// The request plus where it came from, as seen by servants and middleware.
#[derive(Debug, Clone)]
pub struct Current {
    /// Name of the adapter dispatching the request.
    pub adapter: String,
    /// The connection the request arrived on. `None` for collocated calls.
    pub connection: Option<Arc<Connection>>,
    pub request: IncomingRequest,
}

impl Current {
    /// The error to return for an operation the servant does not implement.
    pub fn operation_not_exist(&self) -> IceError {
        IceError::OperationNotExist {
            id: self.request.identity.clone(),
            facet: self.request.facet.clone(),
            operation: self.request.operation.clone(),
        }
    }

    /// Describes the connection for log output.
    pub fn connection_description(&self) -> String {
        self.connection
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "collocated".to_string())
    }
}

/// A reply, marshaled except for the reply message header and request id.
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    status: ReplyStatus,
    body: Bytes,
    error: Option<IceError>,
}

impl OutgoingResponse {
    /// A successful reply carrying marshaled `results`.
    pub fn ok(encoding: EncodingVersion, results: &[u8]) -> Self {
        let mut os = OutputStream::with_encoding(encoding);
        os.write_encapsulation(encoding, results);
        Self {
            status: ReplyStatus::Ok,
            body: os.finished(),
            error: None,
        }
    }

    /// Converts a dispatch error into the matching reply.
    ///
    /// Errors other than user exceptions and the request-failed family are
    /// reported as `UnknownLocalException` carrying only their description.
    pub fn from_error(request: &IncomingRequest, error: IceError) -> Self {
        let mut os = OutputStream::with_encoding(request.encoding);
        let status = match &error {
            IceError::UserException { type_id, data } => {
                let mut ex = OutputStream::with_encoding(request.encoding);
                ex.write_string(type_id);
                ex.write_blob(data);
                os.write_encapsulation(request.encoding, ex.as_bytes());
                ReplyStatus::UserException
            }
            IceError::ObjectNotExist { id, facet, operation }
            | IceError::FacetNotExist { id, facet, operation }
            | IceError::OperationNotExist { id, facet, operation } => {
                // Fall back to the request's target when the error names none.
                if id.is_null() {
                    os.write(&request.identity);
                } else {
                    os.write(id);
                }
                let facet = if facet.is_empty() { &request.facet } else { facet };
                if facet.is_empty() {
                    os.write_size(0);
                } else {
                    os.write_string_seq(&[facet]);
                }
                os.write_string(if operation.is_empty() { &request.operation } else { operation });
                match &error {
                    IceError::ObjectNotExist { .. } => ReplyStatus::ObjectNotExist,
                    IceError::FacetNotExist { .. } => ReplyStatus::FacetNotExist,
                    _ => ReplyStatus::OperationNotExist,
                }
            }
            IceError::UnknownUserException(reason) => {
                os.write_string(reason);
                ReplyStatus::UnknownUserException
            }
            IceError::UnknownException(reason) => {
                os.write_string(reason);
                ReplyStatus::UnknownException
            }
            IceError::UnknownLocalException(reason) => {
                os.write_string(reason);
                ReplyStatus::UnknownLocalException
            }
            other => {
                os.write_string(&other.to_string());
                ReplyStatus::UnknownLocalException
            }
        };
        Self {
            status,
            body: os.finished(),
            error: Some(error),
        }
    }

    pub fn status(&self) -> ReplyStatus {
        self.status
    }

    /// The error the reply was created from, if any.
    pub fn error(&self) -> Option<&IceError> {
        self.error.as_ref()
    }

    /// Size of the reply payload, status byte included.
    pub fn size(&self) -> usize {
        1 + self.body.len()
    }

    /// Writes the status byte and payload.
    pub fn write_to(&self, os: &mut OutputStream) {
        os.write_u8(self.status as u8);
        os.write_blob(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ice_core::protocol::ENCODING_1_1;

    fn request() -> IncomingRequest {
        let mut os = OutputStream::new();
        os.write(&Identity::new("hello", "greet"));
        os.write_string_seq(&["admin"]);
        os.write_string("sayHello");
        os.write_u8(OperationMode::Idempotent as u8);
        let mut context = Context::new();
        context.insert("k".to_string(), "v".to_string());
        os.write_context(&context);
        os.write_encapsulation(ENCODING_1_1, &[7, 0, 0, 0]);
        let bytes = os.finished();
        let size = bytes.len();
        IncomingRequest::read(&mut InputStream::new(bytes), 3, size).unwrap()
    }

    #[test]
    fn test_read_request() {
        let request = request();
        assert_eq!(request.request_id, 3);
        assert_eq!(request.identity, Identity::new("hello", "greet"));
        assert_eq!(request.facet, "admin");
        assert_eq!(request.operation, "sayHello");
        assert_eq!(request.mode, OperationMode::Idempotent);
        assert_eq!(request.context.get("k").map(String::as_str), Some("v"));
        assert_eq!(request.input().read_i32().unwrap(), 7);
        assert!(!request.is_oneway());
    }

    #[test]
    fn test_read_batch() {
        let mut os = OutputStream::new();
        os.write_i32(2);
        for op in ["a", "b"] {
            os.write(&Identity::new("x", ""));
            os.write_size(0);
            os.write_string(op);
            os.write_u8(0);
            os.write_size(0);
            os.write_encapsulation(ENCODING_1_1, &[]);
        }
        let requests = read_batch(&mut InputStream::new(os.finished())).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].operation, "b");
        assert!(requests.iter().all(|r| r.is_oneway() && r.size > 0));
    }

    #[test]
    fn test_ok_reply_is_encapsulated() {
        let response = OutgoingResponse::ok(ENCODING_1_1, &[]);
        let mut os = OutputStream::new();
        response.write_to(&mut os);
        assert_eq!(os.as_bytes(), &[0, 6, 0, 0, 0, 1, 1]);
        assert_eq!(response.size(), 7);
    }

    #[test]
    fn test_request_failed_uses_request_target() {
        let request = request();
        let response = OutgoingResponse::from_error(
            &request,
            IceError::OperationNotExist {
                id: Identity::default(),
                facet: String::new(),
                operation: String::new(),
            },
        );
        assert_eq!(response.status(), ReplyStatus::OperationNotExist);

        let mut os = OutputStream::new();
        response.write_to(&mut os);
        let mut is = InputStream::new(os.finished());
        assert_eq!(is.read_u8().unwrap(), ReplyStatus::OperationNotExist as u8);
        assert_eq!(is.read::<Identity>().unwrap(), request.identity);
        assert_eq!(is.read_string_seq().unwrap(), vec!["admin".to_string()]);
        assert_eq!(is.read_string().unwrap(), "sayHello");
    }

    #[test]
    fn test_local_errors_become_unknown_local() {
        let request = request();
        let response = OutgoingResponse::from_error(&request, IceError::Marshal("bad".into()));
        assert_eq!(response.status(), ReplyStatus::UnknownLocalException);
        assert!(matches!(response.error(), Some(IceError::Marshal(_))));
    }
}
