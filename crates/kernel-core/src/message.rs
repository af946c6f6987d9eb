//! Transactions and the two-leg message envelope that carries them through
//! the routing overlay.
//!
//! A message travels up the agent hierarchy one designated hop at a time,
//! recording each holder on a path stack. Once a market reverses it, the
//! stack is consumed in reverse order until the message returns to its
//! originator and becomes terminal. Attempts to steer a downward message are
//! ignored; the return leg always retraces the upward path exactly.

use std::fmt;

use contracts::{AgentId, CommodityId};

use crate::resource::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDir {
    Up,
    Down,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionError {
    BelowMinimum { amount: f64, min_amount: f64 },
    NegativeMinimum(f64),
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::BelowMinimum { amount, min_amount } => write!(
                f,
                "transaction amount {} is below min_amount {}",
                amount, min_amount
            ),
            TransactionError::NegativeMinimum(min_amount) => {
                write!(f, "min_amount must be non-negative, got {}", min_amount)
            }
        }
    }
}

/// The value record of an intended exchange.
///
/// `amount` is signed: negative means requesting, positive means offering.
/// The sign is fixed for the life of a message; market clearing rewrites the
/// magnitude only.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub commodity: CommodityId,
    amount: f64,
    min_amount: f64,
    pub unit_price: f64,
    pub resource: Option<Resource>,
    pub supplier: Option<AgentId>,
    pub requester: Option<AgentId>,
}

impl Transaction {
    pub fn offer(
        commodity: CommodityId,
        amount: f64,
        min_amount: f64,
        unit_price: f64,
    ) -> Result<Self, TransactionError> {
        Self::validated(commodity, amount.abs(), min_amount, unit_price)
    }

    pub fn request(
        commodity: CommodityId,
        amount: f64,
        min_amount: f64,
        unit_price: f64,
    ) -> Result<Self, TransactionError> {
        Self::validated(commodity, -amount.abs(), min_amount, unit_price)
    }

    fn validated(
        commodity: CommodityId,
        amount: f64,
        min_amount: f64,
        unit_price: f64,
    ) -> Result<Self, TransactionError> {
        if min_amount < 0.0 {
            return Err(TransactionError::NegativeMinimum(min_amount));
        }
        if amount.abs() < min_amount {
            return Err(TransactionError::BelowMinimum { amount, min_amount });
        }
        Ok(Self {
            commodity,
            amount,
            min_amount,
            unit_price,
            resource: None,
            supplier: None,
            requester: None,
        })
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn magnitude(&self) -> f64 {
        self.amount.abs()
    }

    pub fn min_amount(&self) -> f64 {
        self.min_amount
    }

    pub fn is_request(&self) -> bool {
        self.amount < 0.0
    }

    /// Rewrites the cleared terms, preserving the amount's sign.
    pub fn record_match(
        &mut self,
        supplier: AgentId,
        requester: AgentId,
        matched: f64,
        unit_price: f64,
    ) {
        let magnitude = matched.abs();
        self.amount = if self.is_request() {
            -magnitude
        } else {
            magnitude
        };
        self.unit_price = unit_price;
        self.supplier = Some(supplier);
        self.requester = Some(requester);
    }

    /// Zeroes the amount for an unfilled notice, leaving endpoints unset.
    pub fn record_unfilled(&mut self) {
        self.amount = 0.0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    NoDestination,
    Circular { agent: AgentId },
    TerminalMessage,
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::NoDestination => {
                write!(f, "send_on with no designated next destination")
            }
            RoutingError::Circular { agent } => {
                write!(f, "circular send targeting agent {}", agent)
            }
            RoutingError::TerminalMessage => {
                write!(f, "message already completed its round trip")
            }
        }
    }
}

/// The envelope carrying a transaction through the routing overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    dir: MessageDir,
    transaction: Transaction,
    originator: AgentId,
    path_stack: Vec<AgentId>,
    next_dest: Option<AgentId>,
    current_holder: AgentId,
}

impl Message {
    pub fn new(originator: AgentId, transaction: Transaction) -> Self {
        Self {
            dir: MessageDir::Up,
            transaction,
            originator,
            path_stack: Vec::new(),
            next_dest: None,
            current_holder: originator,
        }
    }

    pub fn dir(&self) -> MessageDir {
        self.dir
    }

    pub fn is_terminal(&self) -> bool {
        self.dir == MessageDir::Done
    }

    pub fn originator(&self) -> AgentId {
        self.originator
    }

    pub fn current_holder(&self) -> AgentId {
        self.current_holder
    }

    pub fn next_dest(&self) -> Option<AgentId> {
        self.next_dest
    }

    /// The upward hops recorded so far, oldest at the bottom.
    pub fn path(&self) -> &[AgentId] {
        &self.path_stack
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn transaction_mut(&mut self) -> &mut Transaction {
        &mut self.transaction
    }

    /// Designates the next upward hop.
    ///
    /// Ignored while the message travels down (the return leg is fixed by
    /// the path stack). Targeting the current holder is a circular send.
    pub fn set_next_dest(&mut self, agent: AgentId) -> Result<(), RoutingError> {
        match self.dir {
            MessageDir::Down | MessageDir::Done => Ok(()),
            MessageDir::Up => {
                if agent == self.current_holder {
                    return Err(RoutingError::Circular { agent });
                }
                self.next_dest = Some(agent);
                Ok(())
            }
        }
    }

    /// Forwards the message one hop and returns the new holder.
    pub fn send_on(&mut self) -> Result<AgentId, RoutingError> {
        match self.dir {
            MessageDir::Done => Err(RoutingError::TerminalMessage),
            MessageDir::Up => {
                let next = self.next_dest.take().ok_or(RoutingError::NoDestination)?;
                if next == self.originator {
                    return Err(RoutingError::Circular { agent: next });
                }
                self.path_stack.push(self.current_holder);
                self.current_holder = next;
                Ok(next)
            }
            MessageDir::Down => {
                let previous = self.path_stack.pop().ok_or(RoutingError::TerminalMessage)?;
                self.current_holder = previous;
                if self.path_stack.is_empty() {
                    self.dir = MessageDir::Done;
                }
                Ok(previous)
            }
        }
    }

    /// Flips the travel direction; typically invoked by the market after
    /// clearing. The originator is not pushed at flip time: the stack
    /// already holds every intermediate hop, so the reverse traversal ends
    /// at the originator naturally.
    pub fn reverse_direction(&mut self) {
        self.dir = match self.dir {
            MessageDir::Up => MessageDir::Down,
            MessageDir::Down => MessageDir::Up,
            MessageDir::Done => MessageDir::Done,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Basis;

    fn request_message() -> Message {
        let transaction = Transaction::request(0, 60.0, 0.0, 2.0).expect("valid request");
        Message::new(10, transaction)
    }

    fn drive_up(message: &mut Message, hops: &[AgentId]) {
        for hop in hops {
            message.set_next_dest(*hop).expect("set destination");
            assert_eq!(message.send_on().expect("send up"), *hop);
        }
    }

    #[test]
    fn transaction_rejects_amount_below_minimum() {
        assert!(matches!(
            Transaction::offer(0, 5.0, 10.0, 1.0),
            Err(TransactionError::BelowMinimum { .. })
        ));
        assert!(matches!(
            Transaction::request(0, 5.0, -1.0, 1.0),
            Err(TransactionError::NegativeMinimum(_))
        ));
    }

    #[test]
    fn request_amount_is_negative() {
        let transaction = Transaction::request(0, 60.0, 0.0, 2.0).expect("valid request");
        assert!(transaction.is_request());
        assert!((transaction.amount() + 60.0).abs() < 1e-12);
        assert!((transaction.magnitude() - 60.0).abs() < 1e-12);
    }

    #[test]
    fn match_recording_preserves_sign() {
        let mut transaction = Transaction::request(0, 60.0, 0.0, 2.0).expect("valid request");
        transaction.record_match(1, 10, 40.0, 1.0);
        assert!((transaction.amount() + 40.0).abs() < 1e-12);
        assert_eq!(transaction.supplier, Some(1));
        assert_eq!(transaction.requester, Some(10));
    }

    #[test]
    fn up_leg_records_path_in_order() {
        let mut message = request_message();
        drive_up(&mut message, &[11, 12, 13]);
        assert_eq!(message.path(), &[10, 11, 12]);
        assert_eq!(message.current_holder(), 13);
    }

    #[test]
    fn down_leg_retraces_up_leg_exactly() {
        let mut message = request_message();
        drive_up(&mut message, &[11, 12, 13]);
        message.reverse_direction();

        let mut visited = Vec::new();
        while !message.is_terminal() {
            visited.push(message.send_on().expect("send down"));
        }
        assert_eq!(visited, vec![12, 11, 10]);
        assert_eq!(message.current_holder(), message.originator());
    }

    #[test]
    fn send_after_done_is_terminal_error() {
        let mut message = request_message();
        drive_up(&mut message, &[11]);
        message.reverse_direction();
        message.send_on().expect("return to originator");
        assert!(message.is_terminal());
        assert_eq!(message.send_on(), Err(RoutingError::TerminalMessage));
    }

    #[test]
    fn send_without_destination_fails() {
        let mut message = request_message();
        assert_eq!(message.send_on(), Err(RoutingError::NoDestination));
    }

    #[test]
    fn self_destination_is_circular() {
        let mut message = request_message();
        assert_eq!(
            message.set_next_dest(10),
            Err(RoutingError::Circular { agent: 10 })
        );
    }

    #[test]
    fn forwarding_back_to_originator_is_circular() {
        let mut message = request_message();
        drive_up(&mut message, &[11]);
        message.set_next_dest(10).expect("staging is allowed");
        assert_eq!(message.send_on(), Err(RoutingError::Circular { agent: 10 }));
    }

    #[test]
    fn set_next_dest_while_down_is_quietly_ignored() {
        let mut message = request_message();
        drive_up(&mut message, &[11, 12]);
        message.reverse_direction();
        assert!(message.set_next_dest(99).is_ok());
        assert_eq!(message.next_dest(), None);
        assert_eq!(message.send_on().expect("send down"), 11);
    }

    #[test]
    fn clone_shares_no_resource_ownership() {
        let mut message = request_message();
        message.transaction_mut().resource =
            Some(Resource::with_quantity("u235", 10.0, "kg", Basis::Mass));
        drive_up(&mut message, &[11, 12]);

        let mut cloned = message.clone();
        if let Some(resource) = cloned.transaction_mut().resource.as_mut() {
            let _ = resource.extract(4.0).expect("extract from clone");
        }
        cloned.reverse_direction();
        cloned.send_on().expect("clone travels independently");

        let original = message.transaction().resource.as_ref().expect("payload");
        assert!((original.total_quantity() - 10.0).abs() < 1e-9);
        assert_eq!(message.current_holder(), 12);
        assert_eq!(message.dir(), MessageDir::Up);
    }

    #[test]
    fn clone_retraces_same_down_path_as_original() {
        let mut original = request_message();
        drive_up(&mut original, &[11, 12, 13]);
        let mut cloned = original.clone();

        original.reverse_direction();
        cloned.reverse_direction();
        let mut original_path = Vec::new();
        let mut cloned_path = Vec::new();
        while !original.is_terminal() {
            original_path.push(original.send_on().expect("send down"));
        }
        while !cloned.is_terminal() {
            cloned_path.push(cloned.send_on().expect("send down"));
        }
        assert_eq!(original_path, cloned_path);
    }
}
