//! Application Request Control Block
//!
//! An [`Iocb`] pairs a request PDU with its response/error slots and a
//! completion signal. The core never looks inside one; it exists for the
//! application boundary, where a caller wants to tie the reply (or the
//! failure) back to the request it made. The test harness uses it to pair
//! scripted requests with their answers.

use crate::comm::StackError;
use crate::pdu::Pdu;

/// Lifecycle of a control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IocbState {
    /// Waiting for a response.
    Pending,
    /// A response arrived.
    Completed,
    /// The request failed; see the error slot.
    Aborted,
}

/// One outstanding application request.
#[derive(Debug, Clone)]
pub struct Iocb {
    request: Pdu,
    response: Option<Pdu>,
    error: Option<StackError>,
    state: IocbState,
}

impl Iocb {
    pub fn new(request: Pdu) -> Self {
        Self {
            request,
            response: None,
            error: None,
            state: IocbState::Pending,
        }
    }

    pub fn request(&self) -> &Pdu {
        &self.request
    }

    pub fn state(&self) -> IocbState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state != IocbState::Pending
    }

    /// Fill the response slot and signal completion.
    pub fn complete(&mut self, response: Pdu) {
        self.response = Some(response);
        self.state = IocbState::Completed;
    }

    /// Fill the error slot and signal completion.
    pub fn abort(&mut self, error: StackError) {
        self.error = Some(error);
        self.state = IocbState::Aborted;
    }

    pub fn response(&self) -> Option<&Pdu> {
        self.response.as_ref()
    }

    pub fn error(&self) -> Option<&StackError> {
        self.error.as_ref()
    }
}
