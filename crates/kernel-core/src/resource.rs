//! Conserved material quantities: composition maps with mass-preserving
//! absorb/extract arithmetic.

use std::collections::BTreeMap;
use std::fmt;

/// Relative tolerance for conservation accounting.
pub const QUANTITY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    Atom,
    Mass,
}

/// Errors from resource arithmetic.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceError {
    NegativeAmount(f64),
    Insufficient { requested: f64, available: f64 },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::NegativeAmount(amount) => {
                write!(f, "cannot extract negative amount: {}", amount)
            }
            ResourceError::Insufficient {
                requested,
                available,
            } => {
                write!(
                    f,
                    "insufficient quantity: requested {}, available {}",
                    requested, available
                )
            }
        }
    }
}

/// An owned quantity of conserved stuff.
///
/// The composition maps species identifiers to non-negative scalars; the
/// kernel treats species as opaque and only sums and splits them. A resource
/// has exactly one owner at any instant: `absorb` consumes its argument and
/// `extract` splits off a freshly owned piece.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    composition: BTreeMap<String, f64>,
    units: String,
    basis: Basis,
}

impl Resource {
    pub fn new(composition: BTreeMap<String, f64>, units: impl Into<String>, basis: Basis) -> Self {
        let composition = composition
            .into_iter()
            .filter(|(_, quantity)| quantity.is_finite() && *quantity > 0.0)
            .collect();
        Self {
            composition,
            units: units.into(),
            basis,
        }
    }

    /// Single-species convenience constructor.
    pub fn with_quantity(
        species: impl Into<String>,
        quantity: f64,
        units: impl Into<String>,
        basis: Basis,
    ) -> Self {
        let mut composition = BTreeMap::new();
        composition.insert(species.into(), quantity);
        Self::new(composition, units, basis)
    }

    pub fn empty(units: impl Into<String>, basis: Basis) -> Self {
        Self {
            composition: BTreeMap::new(),
            units: units.into(),
            basis,
        }
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn basis(&self) -> Basis {
        self.basis
    }

    pub fn composition(&self) -> &BTreeMap<String, f64> {
        &self.composition
    }

    pub fn total_quantity(&self) -> f64 {
        self.composition.values().sum()
    }

    pub fn is_depleted(&self) -> bool {
        self.total_quantity() <= QUANTITY_TOLERANCE
    }

    /// Consumes `other` entirely, folding its composition into `self`.
    pub fn absorb(&mut self, other: Resource) {
        for (species, quantity) in other.composition {
            *self.composition.entry(species).or_insert(0.0) += quantity;
        }
    }

    /// Splits off exactly `amount`, preserving the composition recipe.
    ///
    /// The split is proportional per species, so the extracted piece carries
    /// the same recipe as the source. Over-draws beyond the relative
    /// tolerance fail without mutating `self`.
    pub fn extract(&mut self, amount: f64) -> Result<Resource, ResourceError> {
        if amount < 0.0 || !amount.is_finite() {
            return Err(ResourceError::NegativeAmount(amount));
        }
        let available = self.total_quantity();
        if amount > available * (1.0 + QUANTITY_TOLERANCE) + QUANTITY_TOLERANCE {
            return Err(ResourceError::Insufficient {
                requested: amount,
                available,
            });
        }
        if available <= 0.0 || amount <= 0.0 {
            return Ok(Resource::empty(self.units.clone(), self.basis));
        }

        let fraction = (amount / available).min(1.0);
        let mut extracted = BTreeMap::new();
        for (species, quantity) in self.composition.iter_mut() {
            let piece = *quantity * fraction;
            *quantity -= piece;
            extracted.insert(species.clone(), piece);
        }
        self.composition
            .retain(|_, quantity| *quantity > QUANTITY_TOLERANCE);
        Ok(Resource::new(extracted, self.units.clone(), self.basis))
    }
}
