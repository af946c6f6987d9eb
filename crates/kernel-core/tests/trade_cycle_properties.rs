use contracts::scenario::ScenarioDoc;
use contracts::{AgentId, EventType};
use kernel_core::facility::FacilityKindRegistry;
use kernel_core::market::MarketBooks;
use kernel_core::message::{Message, RoutingError, Transaction, TransactionError};
use kernel_core::resource::{Basis, Resource};
use kernel_core::world::SimWorld;
use proptest::prelude::*;
use serde_json::json;

fn trade_scenario(
    supplier_inventory: f64,
    supplier_capacity: f64,
    request_cap: f64,
    horizon_months: u64,
) -> ScenarioDoc {
    serde_json::from_value(json!({
        "run_id": "run_properties",
        "horizon_months": horizon_months,
        "commodities": [
            {"name": "u", "market": "u_market"},
            {"name": "spent", "market": "spent_market"}
        ],
        "markets": [
            {"name": "u_market"},
            {"name": "spent_market"}
        ],
        "regions": [{
            "name": "north",
            "institutions": [{
                "name": "utility",
                "facilities": [
                    {
                        "name": "mill",
                        "kind": "recipe_reactor",
                        "params": {
                            "in_commodity": "spent",
                            "out_commodity": "u",
                            "inventory_cap": supplier_inventory.max(supplier_capacity),
                            "monthly_capacity": supplier_capacity,
                            "offer_price": 1.0,
                            "initial_inventory": supplier_inventory
                        }
                    },
                    {
                        "name": "reactor",
                        "kind": "recipe_reactor",
                        "params": {
                            "in_commodity": "u",
                            "out_commodity": "spent",
                            "inventory_cap": request_cap,
                            "monthly_capacity": request_cap,
                            "request_price": 2.0
                        }
                    }
                ]
            }]
        }]
    }))
    .expect("scenario should deserialize")
}

fn built_world(doc: &ScenarioDoc) -> SimWorld {
    let kinds = FacilityKindRegistry::with_builtin_kinds();
    SimWorld::from_scenario(doc, &kinds).expect("world should build")
}

#[test]
fn property_offer_below_minimum_is_a_construction_error() {
    assert!(matches!(
        Transaction::offer(0, 3.0, 5.0, 1.0),
        Err(TransactionError::BelowMinimum { .. })
    ));
}

#[test]
fn property_zero_amount_request_is_dropped_by_the_market() {
    let mut books = MarketBooks::default();
    books.book(Message::new(
        1,
        Transaction::request(0, 0.0, 0.0, 2.0).expect("zero request is constructible"),
    ));
    let resolution = books.resolve(0);
    assert!(resolution.matches.is_empty());
    assert!(resolution.outbound.is_empty());
}

#[test]
fn property_circular_send_is_rejected() {
    let mut message = Message::new(4, Transaction::offer(0, 10.0, 0.0, 1.0).expect("offer"));
    assert_eq!(
        message.set_next_dest(4),
        Err(RoutingError::Circular { agent: 4 })
    );

    message.set_next_dest(5).expect("forward hop");
    message.send_on().expect("send up");
    message.set_next_dest(4).expect("staging succeeds");
    assert_eq!(message.send_on(), Err(RoutingError::Circular { agent: 4 }));
}

#[test]
fn property_send_after_done_is_terminal() {
    let mut message = Message::new(4, Transaction::offer(0, 10.0, 0.0, 1.0).expect("offer"));
    message.set_next_dest(5).expect("forward hop");
    message.send_on().expect("send up");
    message.reverse_direction();
    message.send_on().expect("return to originator");
    assert!(message.is_terminal());
    assert_eq!(message.send_on(), Err(RoutingError::TerminalMessage));
}

#[test]
fn property_matched_trades_respect_both_price_bounds() {
    let doc = trade_scenario(100.0, 0.0, 60.0, 1);
    let mut world = built_world(&doc);
    world.step_month().expect("month commits");

    for event in world.events() {
        if event.event_type != EventType::TradeMatched {
            continue;
        }
        let details = event.details.as_ref().expect("match details");
        let price = details["unit_price"].as_f64().expect("price");
        let supplier = details["supplier"].as_u64().expect("supplier");
        let requester = details["requester"].as_u64().expect("requester");
        assert!(supplier != requester);
        assert!(price >= 1.0 && price <= 2.0);
    }
}

proptest! {
    #[test]
    fn property_conservation_under_random_trades(
        supplier_inventory in 10.0_f64..200.0,
        supplier_capacity in 0.0_f64..50.0,
        request_cap in 5.0_f64..120.0,
        months in 1_u64..4,
    ) {
        let doc = trade_scenario(supplier_inventory, supplier_capacity, request_cap, months);
        let mut world = built_world(&doc);
        let initial = world.total_material();
        world.step_n(months).expect("months commit");
        let observed = world.total_material();
        prop_assert!((observed - initial).abs() <= initial.abs().max(1.0) * 1e-9);
    }

    #[test]
    fn property_matched_amount_never_exceeds_either_side(
        offered in 1.0_f64..100.0,
        requested in 1.0_f64..100.0,
    ) {
        let mut books = MarketBooks::default();
        books.book(Message::new(
            1,
            Transaction::offer(0, offered, 0.0, 1.0).expect("offer"),
        ));
        books.book(Message::new(
            2,
            Transaction::request(0, requested, 0.0, 2.0).expect("request"),
        ));
        let resolution = books.resolve(0);
        prop_assert_eq!(resolution.matches.len(), 1);
        let record = &resolution.matches[0];
        prop_assert!(record.amount <= offered + 1e-9);
        prop_assert!(record.amount <= requested + 1e-9);
        prop_assert!((record.amount - offered.min(requested)).abs() < 1e-9);
    }

    #[test]
    fn property_extract_then_absorb_restores_quantity(
        total in 1.0_f64..1000.0,
        fraction in 0.0_f64..1.0,
    ) {
        let mut resource = Resource::with_quantity("u", total, "kg", Basis::Mass);
        let amount = total * fraction;
        let piece = resource.extract(amount).expect("extract within bounds");
        prop_assert!((piece.total_quantity() - amount).abs() <= total * 1e-9);
        resource.absorb(piece);
        prop_assert!((resource.total_quantity() - total).abs() <= total * 1e-9);
    }

    #[test]
    fn property_down_leg_reverses_up_leg(hops in 1_usize..8) {
        let originator: AgentId = 100;
        let mut message = Message::new(
            originator,
            Transaction::request(0, 10.0, 0.0, 1.0).expect("request"),
        );
        let up_hops: Vec<AgentId> = (0..hops).map(|i| 101 + i as AgentId).collect();
        for hop in &up_hops {
            message.set_next_dest(*hop).expect("set destination");
            message.send_on().expect("send up");
        }
        prop_assert_eq!(message.path().len(), hops);

        message.reverse_direction();
        let mut down_hops = Vec::new();
        while !message.is_terminal() {
            down_hops.push(message.send_on().expect("send down"));
        }

        let mut expected: Vec<AgentId> = up_hops[..hops - 1].to_vec();
        expected.reverse();
        expected.push(originator);
        prop_assert_eq!(down_hops, expected);
    }

    #[test]
    fn property_clone_and_original_route_identically(hops in 1_usize..6) {
        let mut original = Message::new(
            50,
            Transaction::offer(0, 25.0, 0.0, 1.0).expect("offer"),
        );
        for i in 0..hops {
            original.set_next_dest(60 + i as AgentId).expect("set destination");
            original.send_on().expect("send up");
        }
        let mut cloned = original.clone();
        original.reverse_direction();
        cloned.reverse_direction();

        let mut original_path = Vec::new();
        while !original.is_terminal() {
            original_path.push(original.send_on().expect("send down"));
        }
        let mut cloned_path = Vec::new();
        while !cloned.is_terminal() {
            cloned_path.push(cloned.send_on().expect("send down"));
        }
        prop_assert_eq!(original_path, cloned_path);
    }
}
