//! Per-commodity bid books and the deterministic matching engine.

use std::collections::BTreeMap;

use contracts::{AgentId, CommodityId};

use crate::message::Message;

/// Amounts at or below this are treated as exhausted book entries.
const BOOK_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct BookEntry {
    pub message: Message,
    /// Remaining unmatched magnitude.
    pub remaining: f64,
}

#[derive(Debug, Clone)]
pub struct MatchRecord {
    pub commodity: CommodityId,
    pub supplier: AgentId,
    pub requester: AgentId,
    pub amount: f64,
    pub unit_price: f64,
}

/// What one clearing pass produced: matched and notice messages already
/// reversed for the return leg, plus records for the event stream.
#[derive(Debug, Default)]
pub struct Resolution {
    pub outbound: Vec<Message>,
    pub matches: Vec<MatchRecord>,
    pub unfilled: Vec<(AgentId, f64)>,
    pub rolled_forward: Vec<(AgentId, f64)>,
}

/// The per-period offer and request books of one market agent.
#[derive(Debug, Clone, Default)]
pub struct MarketBooks {
    offers: BTreeMap<CommodityId, Vec<BookEntry>>,
    requests: BTreeMap<CommodityId, Vec<BookEntry>>,
}

impl MarketBooks {
    /// Files an upward message into the matching book for its commodity.
    /// Zero-amount entries are dropped silently.
    pub fn book(&mut self, message: Message) {
        let magnitude = message.transaction().magnitude();
        if magnitude <= BOOK_EPSILON {
            return;
        }
        let commodity = message.transaction().commodity;
        let book = if message.transaction().is_request() {
            self.requests.entry(commodity).or_default()
        } else {
            self.offers.entry(commodity).or_default()
        };
        book.push(BookEntry {
            remaining: magnitude,
            message,
        });
    }

    pub fn open_offers(&self, commodity: CommodityId) -> (usize, f64) {
        summarize(self.offers.get(&commodity))
    }

    pub fn open_requests(&self, commodity: CommodityId) -> (usize, f64) {
        summarize(self.requests.get(&commodity))
    }

    /// Clears one commodity's books.
    ///
    /// Offers are taken cheapest-first and requests highest-paying-first,
    /// ties broken by ascending originator id. Matching stops at the first
    /// non-crossing pair. Every entry left with an unmatched residual gets a
    /// zero-amount notice back to its originator; requests whose residual is
    /// still at or above their minimum stay booked for the next period,
    /// while leftover offers expire.
    pub fn resolve(&mut self, commodity: CommodityId) -> Resolution {
        let mut offers = self.offers.remove(&commodity).unwrap_or_default();
        let mut requests = self.requests.remove(&commodity).unwrap_or_default();

        offers.sort_by(|a, b| {
            a.message
                .transaction()
                .unit_price
                .total_cmp(&b.message.transaction().unit_price)
                .then(a.message.originator().cmp(&b.message.originator()))
        });
        requests.sort_by(|a, b| {
            b.message
                .transaction()
                .unit_price
                .total_cmp(&a.message.transaction().unit_price)
                .then(a.message.originator().cmp(&b.message.originator()))
        });

        let mut resolution = Resolution::default();
        let mut offer_index = 0;
        let mut request_index = 0;

        while offer_index < offers.len() && request_index < requests.len() {
            let offer_price = offers[offer_index].message.transaction().unit_price;
            let request_price = requests[request_index].message.transaction().unit_price;
            if request_price < offer_price {
                break;
            }

            let matched = offers[offer_index]
                .remaining
                .min(requests[request_index].remaining);
            let supplier = offers[offer_index].message.originator();
            let requester = requests[request_index].message.originator();
            if supplier == requester {
                // An agent never clears against itself; its request waits
                // for the next period instead.
                request_index += 1;
                continue;
            }

            resolution.outbound.push(matched_clone(
                &requests[request_index].message,
                supplier,
                requester,
                matched,
                offer_price,
            ));
            resolution.outbound.push(matched_clone(
                &offers[offer_index].message,
                supplier,
                requester,
                matched,
                offer_price,
            ));
            resolution.matches.push(MatchRecord {
                commodity,
                supplier,
                requester,
                amount: matched,
                unit_price: offer_price,
            });

            offers[offer_index].remaining -= matched;
            requests[request_index].remaining -= matched;
            if offers[offer_index].remaining <= BOOK_EPSILON {
                offer_index += 1;
            }
            if requests[request_index].remaining <= BOOK_EPSILON {
                request_index += 1;
            }
        }

        for entry in offers {
            if entry.remaining > BOOK_EPSILON {
                resolution
                    .unfilled
                    .push((entry.message.originator(), entry.remaining));
                resolution.outbound.push(unfilled_clone(&entry.message));
            }
        }

        let mut carried = Vec::new();
        for entry in requests {
            if entry.remaining <= BOOK_EPSILON {
                continue;
            }
            resolution
                .unfilled
                .push((entry.message.originator(), entry.remaining));
            resolution.outbound.push(unfilled_clone(&entry.message));
            if entry.remaining >= entry.message.transaction().min_amount() {
                resolution
                    .rolled_forward
                    .push((entry.message.originator(), entry.remaining));
                carried.push(entry);
            }
        }
        if !carried.is_empty() {
            self.requests.insert(commodity, carried);
        }

        resolution
    }
}

fn summarize(entries: Option<&Vec<BookEntry>>) -> (usize, f64) {
    entries
        .map(|book| {
            (
                book.len(),
                book.iter().map(|entry| entry.remaining).sum::<f64>(),
            )
        })
        .unwrap_or((0, 0.0))
}

fn matched_clone(
    message: &Message,
    supplier: AgentId,
    requester: AgentId,
    matched: f64,
    unit_price: f64,
) -> Message {
    let mut clone = message.clone();
    clone
        .transaction_mut()
        .record_match(supplier, requester, matched, unit_price);
    clone.reverse_direction();
    clone
}

fn unfilled_clone(message: &Message) -> Message {
    let mut clone = message.clone();
    clone.transaction_mut().record_unfilled();
    clone.reverse_direction();
    clone
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageDir, Transaction};

    const COMMODITY: CommodityId = 0;

    fn offer(originator: AgentId, amount: f64, price: f64) -> Message {
        Message::new(
            originator,
            Transaction::offer(COMMODITY, amount, 0.0, price).expect("valid offer"),
        )
    }

    fn request(originator: AgentId, amount: f64, price: f64) -> Message {
        Message::new(
            originator,
            Transaction::request(COMMODITY, amount, 0.0, price).expect("valid request"),
        )
    }

    fn request_with_min(originator: AgentId, amount: f64, min: f64, price: f64) -> Message {
        Message::new(
            originator,
            Transaction::request(COMMODITY, amount, min, price).expect("valid request"),
        )
    }

    #[test]
    fn crossing_pair_matches_at_offer_price() {
        let mut books = MarketBooks::default();
        books.book(offer(1, 100.0, 1.0));
        books.book(request(2, 60.0, 2.0));

        let resolution = books.resolve(COMMODITY);
        assert_eq!(resolution.matches.len(), 1);
        let record = &resolution.matches[0];
        assert_eq!(record.supplier, 1);
        assert_eq!(record.requester, 2);
        assert!((record.amount - 60.0).abs() < 1e-9);
        assert!((record.unit_price - 1.0).abs() < 1e-12);

        // Both return clones travel down with the cleared terms.
        let matched: Vec<_> = resolution
            .outbound
            .iter()
            .filter(|message| message.transaction().magnitude() > 0.0)
            .collect();
        assert_eq!(matched.len(), 2);
        for message in matched {
            assert_eq!(message.dir(), MessageDir::Down);
            assert_eq!(message.transaction().supplier, Some(1));
            assert_eq!(message.transaction().requester, Some(2));
        }
    }

    #[test]
    fn matched_offer_mass_equals_matched_request_mass() {
        let mut books = MarketBooks::default();
        books.book(offer(1, 40.0, 1.0));
        books.book(offer(2, 25.0, 1.5));
        books.book(request(3, 30.0, 3.0));
        books.book(request(4, 20.0, 2.0));

        let resolution = books.resolve(COMMODITY);
        let total: f64 = resolution.matches.iter().map(|record| record.amount).sum();
        assert!((total - 50.0).abs() < 1e-9);
    }

    #[test]
    fn price_ties_break_by_originator_id() {
        let mut books = MarketBooks::default();
        books.book(offer(7, 10.0, 1.0));
        books.book(offer(3, 10.0, 1.0));
        books.book(request(9, 10.0, 2.0));

        let resolution = books.resolve(COMMODITY);
        assert_eq!(resolution.matches[0].supplier, 3);
    }

    #[test]
    fn no_cross_returns_zero_amount_notices() {
        let mut books = MarketBooks::default();
        books.book(offer(1, 10.0, 5.0));
        books.book(request(2, 10.0, 3.0));

        let resolution = books.resolve(COMMODITY);
        assert!(resolution.matches.is_empty());
        assert_eq!(resolution.outbound.len(), 2);
        for message in &resolution.outbound {
            assert_eq!(message.dir(), MessageDir::Down);
            assert!((message.transaction().amount()).abs() < 1e-12);
        }
    }

    #[test]
    fn partial_fill_notifies_and_rolls_residual_forward() {
        let mut books = MarketBooks::default();
        books.book(offer(1, 40.0, 1.0));
        books.book(request(2, 60.0, 2.0));

        let resolution = books.resolve(COMMODITY);
        assert!((resolution.matches[0].amount - 40.0).abs() < 1e-9);
        assert_eq!(resolution.unfilled, vec![(2, 20.0)]);
        assert_eq!(resolution.rolled_forward, vec![(2, 20.0)]);

        let (open, remaining) = books.open_requests(COMMODITY);
        assert_eq!(open, 1);
        assert!((remaining - 20.0).abs() < 1e-9);
    }

    #[test]
    fn residual_below_minimum_is_dropped() {
        let mut books = MarketBooks::default();
        books.book(offer(1, 40.0, 1.0));
        books.book(request_with_min(2, 60.0, 30.0, 2.0));

        let resolution = books.resolve(COMMODITY);
        assert!(resolution.rolled_forward.is_empty());
        assert_eq!(resolution.unfilled, vec![(2, 20.0)]);
        assert_eq!(books.open_requests(COMMODITY), (0, 0.0));
    }

    #[test]
    fn zero_amount_request_is_silently_dropped() {
        let mut books = MarketBooks::default();
        books.book(request(2, 0.0, 2.0));
        assert_eq!(books.open_requests(COMMODITY), (0, 0.0));
    }

    #[test]
    fn leftover_offers_expire_after_resolution() {
        let mut books = MarketBooks::default();
        books.book(offer(1, 50.0, 1.0));

        let resolution = books.resolve(COMMODITY);
        assert_eq!(resolution.unfilled, vec![(1, 50.0)]);
        assert_eq!(books.open_offers(COMMODITY), (0, 0.0));
    }

    #[test]
    fn agent_never_matches_its_own_offer() {
        let mut books = MarketBooks::default();
        books.book(offer(1, 10.0, 1.0));
        books.book(request(1, 10.0, 2.0));

        let resolution = books.resolve(COMMODITY);
        assert!(resolution.matches.is_empty());
        assert_eq!(resolution.unfilled.len(), 2);
    }

    #[test]
    fn matched_price_is_between_offer_and_request() {
        let mut books = MarketBooks::default();
        books.book(offer(1, 10.0, 1.5));
        books.book(request(2, 10.0, 4.0));

        let resolution = books.resolve(COMMODITY);
        let record = &resolution.matches[0];
        assert!(record.unit_price >= 1.5 && record.unit_price <= 4.0);
    }
}
