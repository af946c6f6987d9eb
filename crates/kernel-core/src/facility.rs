//! Facility models: the behavior contract every facility kind honors, the
//! name-to-factory kind registry, and the RecipeReactor reference kind.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use contracts::{AgentId, CommodityId};

use crate::agent::CommodityRegistry;
use crate::message::{Message, Transaction, TransactionError};
use crate::resource::{Basis, Resource, ResourceError, QUANTITY_TOLERANCE};

#[derive(Debug, Clone, PartialEq)]
pub enum FacilityError {
    NotSupplier {
        facility: AgentId,
        supplier: Option<AgentId>,
    },
    CommodityMismatch {
        facility: AgentId,
        expected: CommodityId,
        got: CommodityId,
    },
    MissingRequester {
        facility: AgentId,
    },
    UnknownCommodity {
        name: String,
    },
    BadParams {
        kind: &'static str,
        message: String,
    },
    Resource(ResourceError),
    Transaction(TransactionError),
}

impl fmt::Display for FacilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacilityError::NotSupplier { facility, supplier } => write!(
                f,
                "facility {} received an order naming supplier {:?}",
                facility, supplier
            ),
            FacilityError::CommodityMismatch {
                facility,
                expected,
                got,
            } => write!(
                f,
                "facility {} ships commodity {} but the order names {}",
                facility, expected, got
            ),
            FacilityError::MissingRequester { facility } => {
                write!(f, "facility {} cannot ship an order with no requester", facility)
            }
            FacilityError::UnknownCommodity { name } => {
                write!(f, "facility references unknown commodity: {}", name)
            }
            FacilityError::BadParams { kind, message } => {
                write!(f, "invalid {} parameters: {}", kind, message)
            }
            FacilityError::Resource(err) => write!(f, "resource error: {}", err),
            FacilityError::Transaction(err) => write!(f, "transaction error: {}", err),
        }
    }
}

impl From<ResourceError> for FacilityError {
    fn from(value: ResourceError) -> Self {
        FacilityError::Resource(value)
    }
}

impl From<TransactionError> for FacilityError {
    fn from(value: TransactionError) -> Self {
        FacilityError::Transaction(value)
    }
}

/// What the loader hands a freshly constructed facility model.
///
/// Models resolve commodity names through this and must not retain anything
/// from the parameter subtree past `init` return.
pub struct InitContext<'a> {
    pub id: AgentId,
    pub name: &'a str,
    commodities: &'a CommodityRegistry,
}

impl<'a> InitContext<'a> {
    pub fn new(id: AgentId, name: &'a str, commodities: &'a CommodityRegistry) -> Self {
        Self {
            id,
            name,
            commodities,
        }
    }

    pub fn resolve_commodity(&self, name: &str) -> Result<CommodityId, FacilityError> {
        self.commodities
            .resolve(name)
            .map_err(|_| FacilityError::UnknownCommodity {
                name: name.to_string(),
            })
    }
}

/// A fulfilled order ready for delivery: the cleared transaction plus the
/// owned resources leaving the supplier.
#[derive(Debug)]
pub struct Shipment {
    pub transaction: Transaction,
    pub manifest: Vec<Resource>,
}

impl Shipment {
    pub fn total_quantity(&self) -> f64 {
        self.manifest
            .iter()
            .map(Resource::total_quantity)
            .sum()
    }
}

/// The capability set every facility kind implements. Models are owned by
/// the arena and cross thread boundaries with it.
pub trait FacilityModel: fmt::Debug + Send {
    fn kind(&self) -> &'static str;

    fn init(&mut self, ctx: &InitContext<'_>, params: &Value) -> Result<(), FacilityError>;

    /// Advertise: emit the period's request/offer transactions.
    fn handle_tick(&mut self, month: u64) -> Result<Vec<Transaction>, FacilityError>;

    /// Execute: process stocks and fulfill waiting orders.
    fn handle_tock(&mut self, month: u64) -> Result<Vec<Shipment>, FacilityError>;

    /// Accepts a returned down-leg message: an order naming this facility as
    /// supplier, or a notice addressed to it as originator/requester.
    fn receive_message(&mut self, message: Message) -> Result<(), FacilityError>;

    fn receive_material(&mut self, transaction: &Transaction, manifest: Vec<Resource>);

    /// Total material held, for conservation accounting.
    fn held_quantity(&self) -> f64;

    fn stock_quantities(&self) -> Vec<f64>;

    fn inventory_quantities(&self) -> Vec<f64>;

    fn orders_pending(&self) -> usize;
}

pub type FacilityFactory = fn() -> Box<dyn FacilityModel>;

/// The plugin surface: facility kinds register a constructor under their
/// kind tag; the scenario loader constructs and then `init`s each instance.
#[derive(Debug, Default)]
pub struct FacilityKindRegistry {
    factories: BTreeMap<String, FacilityFactory>,
}

impl FacilityKindRegistry {
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::default();
        registry.register("recipe_reactor", || Box::new(RecipeReactor::new()));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: FacilityFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn construct(&self, kind: &str) -> Option<Box<dyn FacilityModel>> {
        self.factories.get(kind).map(|factory| factory())
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeReactorParams {
    in_commodity: String,
    out_commodity: String,
    inventory_cap: f64,
    monthly_capacity: f64,
    #[serde(default)]
    offer_price: f64,
    #[serde(default)]
    request_price: f64,
    #[serde(default)]
    initial_inventory: f64,
    #[serde(default)]
    initial_stocks: f64,
    #[serde(default = "default_units")]
    units: String,
    #[serde(default = "default_recipe")]
    recipe: BTreeMap<String, f64>,
}

fn default_units() -> String {
    "kg".to_string()
}

fn default_recipe() -> BTreeMap<String, f64> {
    let mut recipe = BTreeMap::new();
    recipe.insert("u".to_string(), 1.0);
    recipe
}

/// Reference facility kind.
///
/// Each tick it requests enough input commodity to refill toward its
/// inventory cap (bounded by monthly acceptance capacity) and offers what it
/// could hold of the output commodity. Each tock it converts stocks into
/// inventory at its monthly rate and ships every waiting order.
#[derive(Debug)]
pub struct RecipeReactor {
    id: AgentId,
    name: String,
    in_commodity: CommodityId,
    out_commodity: CommodityId,
    inventory_cap: f64,
    monthly_capacity: f64,
    offer_price: f64,
    request_price: f64,
    units: String,
    recipe: BTreeMap<String, f64>,
    stocks: VecDeque<Resource>,
    inventory: VecDeque<Resource>,
    orders_waiting: VecDeque<Message>,
    notices: Vec<Message>,
}

impl RecipeReactor {
    pub fn new() -> Self {
        Self {
            id: 0,
            name: String::new(),
            in_commodity: 0,
            out_commodity: 0,
            inventory_cap: 0.0,
            monthly_capacity: 0.0,
            offer_price: 0.0,
            request_price: 0.0,
            units: default_units(),
            recipe: default_recipe(),
            stocks: VecDeque::new(),
            inventory: VecDeque::new(),
            orders_waiting: VecDeque::new(),
            notices: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stocks_quantity(&self) -> f64 {
        self.stocks.iter().map(Resource::total_quantity).sum()
    }

    pub fn inventory_quantity(&self) -> f64 {
        self.inventory.iter().map(Resource::total_quantity).sum()
    }

    /// Down-leg confirmations and unfilled notices delivered back to this
    /// facility as originator.
    pub fn notices(&self) -> &[Message] {
        &self.notices
    }

    fn batch(&self, quantity: f64) -> Resource {
        let weight: f64 = self.recipe.values().sum();
        let mut composition = BTreeMap::new();
        if weight > 0.0 {
            for (species, share) in &self.recipe {
                composition.insert(species.clone(), quantity * share / weight);
            }
        }
        Resource::new(composition, self.units.clone(), Basis::Mass)
    }

    /// Pulls resources off `queue` front-first until `target` is gathered,
    /// splitting the last one when it is larger than the remaining need.
    fn split_or_take(
        queue: &mut VecDeque<Resource>,
        target: f64,
    ) -> Result<Vec<Resource>, ResourceError> {
        let mut taken = Vec::new();
        let mut gathered = 0.0;
        while gathered + QUANTITY_TOLERANCE < target {
            let Some(mut front) = queue.pop_front() else {
                break;
            };
            let available = front.total_quantity();
            let need = target - gathered;
            if available <= need + QUANTITY_TOLERANCE {
                gathered += available;
                taken.push(front);
            } else {
                let piece = front.extract(need)?;
                gathered += piece.total_quantity();
                taken.push(piece);
                queue.push_front(front);
            }
        }
        Ok(taken)
    }

    fn send_material(&mut self, transaction: &Transaction) -> Result<Shipment, FacilityError> {
        if transaction.commodity != self.out_commodity {
            return Err(FacilityError::CommodityMismatch {
                facility: self.id,
                expected: self.out_commodity,
                got: transaction.commodity,
            });
        }
        // Partial fulfillment is permitted; the manifest simply comes up short.
        let manifest = Self::split_or_take(&mut self.inventory, transaction.magnitude())?;
        Ok(Shipment {
            transaction: transaction.clone(),
            manifest,
        })
    }
}

impl Default for RecipeReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl FacilityModel for RecipeReactor {
    fn kind(&self) -> &'static str {
        "recipe_reactor"
    }

    fn init(&mut self, ctx: &InitContext<'_>, params: &Value) -> Result<(), FacilityError> {
        let params: RecipeReactorParams =
            serde_json::from_value(params.clone()).map_err(|err| FacilityError::BadParams {
                kind: "recipe_reactor",
                message: err.to_string(),
            })?;
        if params.inventory_cap < 0.0 || params.monthly_capacity < 0.0 {
            return Err(FacilityError::BadParams {
                kind: "recipe_reactor",
                message: "inventory_cap and monthly_capacity must be non-negative".to_string(),
            });
        }

        self.id = ctx.id;
        self.name = ctx.name.to_string();
        self.in_commodity = ctx.resolve_commodity(&params.in_commodity)?;
        self.out_commodity = ctx.resolve_commodity(&params.out_commodity)?;
        self.inventory_cap = params.inventory_cap;
        self.monthly_capacity = params.monthly_capacity;
        self.offer_price = params.offer_price;
        self.request_price = params.request_price;
        self.units = params.units;
        self.recipe = params.recipe;

        if params.initial_inventory > 0.0 {
            let batch = self.batch(params.initial_inventory);
            self.inventory.push_back(batch);
        }
        if params.initial_stocks > 0.0 {
            let batch = self.batch(params.initial_stocks);
            self.stocks.push_back(batch);
        }
        Ok(())
    }

    fn handle_tick(&mut self, _month: u64) -> Result<Vec<Transaction>, FacilityError> {
        let inventory = self.inventory_quantity();
        let stocks = self.stocks_quantity();
        let mut proposals = Vec::new();

        let free_space = (self.inventory_cap - inventory - stocks).max(0.0);
        if free_space > QUANTITY_TOLERANCE {
            let acceptance = (self.monthly_capacity - stocks).max(0.0);
            let request_amount = free_space.min(acceptance);
            if request_amount > QUANTITY_TOLERANCE {
                proposals.push(Transaction::request(
                    self.in_commodity,
                    request_amount,
                    0.0,
                    self.request_price,
                )?);
            }
        }

        let offer_amount = (inventory + self.monthly_capacity).min(self.inventory_cap);
        proposals.push(Transaction::offer(
            self.out_commodity,
            offer_amount,
            0.0,
            self.offer_price,
        )?);
        Ok(proposals)
    }

    fn handle_tock(&mut self, _month: u64) -> Result<Vec<Shipment>, FacilityError> {
        // Convert stocks to inventory at the monthly rate.
        let processed = Self::split_or_take(&mut self.stocks, self.monthly_capacity)?;
        for batch in processed {
            self.inventory.push_back(batch);
        }

        // Ship every waiting order.
        let mut shipments = Vec::new();
        while let Some(order) = self.orders_waiting.pop_front() {
            let shipment = self.send_material(order.transaction())?;
            shipments.push(shipment);
        }
        Ok(shipments)
    }

    fn receive_message(&mut self, message: Message) -> Result<(), FacilityError> {
        let transaction = message.transaction();
        if transaction.supplier == Some(self.id) {
            self.orders_waiting.push_back(message);
            return Ok(());
        }
        if transaction.requester == Some(self.id) || message.originator() == self.id {
            self.notices.push(message);
            return Ok(());
        }
        Err(FacilityError::NotSupplier {
            facility: self.id,
            supplier: transaction.supplier,
        })
    }

    fn receive_material(&mut self, _transaction: &Transaction, manifest: Vec<Resource>) {
        for resource in manifest {
            self.stocks.push_back(resource);
        }
    }

    fn held_quantity(&self) -> f64 {
        self.stocks_quantity() + self.inventory_quantity()
    }

    fn stock_quantities(&self) -> Vec<f64> {
        self.stocks.iter().map(Resource::total_quantity).collect()
    }

    fn inventory_quantities(&self) -> Vec<f64> {
        self.inventory
            .iter()
            .map(Resource::total_quantity)
            .collect()
    }

    fn orders_pending(&self) -> usize {
        self.orders_waiting.len()
    }
}
