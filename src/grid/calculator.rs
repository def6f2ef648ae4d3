//! Grid calculator - turns price bounds into an ordered ladder of levels

use log::debug;

use super::config::{GridConfig, SpacingMode};
use super::errors::{GridError, GridResult};
use super::types::{GridLevel, OrderSide};

/// Calculates grid levels for a spacing mode
#[derive(Debug, Clone, Copy, Default)]
pub struct GridCalculator {
    pub mode: SpacingMode,
}

impl GridCalculator {
    pub fn new(mode: SpacingMode) -> Self {
        Self { mode }
    }

    /// Uniform price spacing
    pub fn arithmetic() -> Self {
        Self::new(SpacingMode::Arithmetic)
    }

    /// Uniform ratio spacing
    pub fn geometric() -> Self {
        Self::new(SpacingMode::Geometric)
    }

    /// Compute `count` levels from `lower` to `upper`, both included.
    ///
    /// Levels strictly below `reference_price` are buys, the rest sells.
    pub fn compute(
        &self,
        lower: f64,
        upper: f64,
        count: usize,
        reference_price: f64,
    ) -> GridResult<Vec<GridLevel>> {
        self.check_range(lower, upper, count)?;

        let last = count - 1;
        let step = self.spacing(lower, upper, count);

        let levels = (0..count)
            .map(|i| {
                let price = if i == last {
                    upper
                } else {
                    match self.mode {
                        SpacingMode::Arithmetic => lower + step * i as f64,
                        SpacingMode::Geometric => lower * step.powi(i as i32),
                    }
                };
                GridLevel::new(i, price, determine_side(price, reference_price))
            })
            .collect();

        Ok(levels)
    }

    /// Compute levels for a config, resolving auto bounds and price rounding
    pub fn compute_for_config(&self, config: &GridConfig, reference_price: f64) -> GridResult<Vec<GridLevel>> {
        let (lower, upper) = if config.auto_price {
            auto_range(reference_price, config.price_range)?
        } else {
            (config.lower_price, config.upper_price)
        };

        let mut levels = self.compute(lower, upper, config.grid_num, reference_price)?;

        if config.price_decimals.is_some() {
            for level in &mut levels {
                level.price = config.round_price(level.price);
                level.side = determine_side(level.price, reference_price);
            }
            if levels.windows(2).any(|w| w[1].price <= w[0].price) {
                return Err(GridError::InvalidRange(format!(
                    "{} levels between {} and {} collapse at {:?} price decimals",
                    config.grid_num, lower, upper, config.price_decimals
                )));
            }
        }

        debug!(
            "Computed {} {:?} levels from {:.8} to {:.8}",
            levels.len(),
            self.mode,
            lower,
            upper
        );

        Ok(levels)
    }

    /// Arithmetic delta, or geometric ratio, between adjacent levels
    pub fn spacing(&self, lower: f64, upper: f64, count: usize) -> f64 {
        let intervals = count.saturating_sub(1).max(1) as f64;
        match self.mode {
            SpacingMode::Arithmetic => (upper - lower) / intervals,
            SpacingMode::Geometric => (upper / lower).powf(1.0 / intervals),
        }
    }

    fn check_range(&self, lower: f64, upper: f64, count: usize) -> GridResult<()> {
        if !lower.is_finite() || !upper.is_finite() {
            return Err(GridError::InvalidRange(format!(
                "bounds must be finite, got [{}, {}]",
                lower, upper
            )));
        }
        if upper <= lower {
            return Err(GridError::InvalidRange(format!(
                "upper {} must exceed lower {}",
                upper, lower
            )));
        }
        if count < 2 {
            return Err(GridError::InvalidRange(format!(
                "need at least 2 levels, got {}",
                count
            )));
        }
        if self.mode == SpacingMode::Geometric && lower <= 0.0 {
            return Err(GridError::InvalidRange(format!(
                "geometric spacing requires a positive lower bound, got {}",
                lower
            )));
        }
        Ok(())
    }
}

/// Below the reference price is a buy, at or above is a sell
pub fn determine_side(level_price: f64, reference_price: f64) -> OrderSide {
    if level_price < reference_price {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    }
}

/// Bounds `reference * (1 ± price_range)` for auto-price mode
pub fn auto_range(reference_price: f64, price_range: f64) -> GridResult<(f64, f64)> {
    if !(reference_price.is_finite() && reference_price > 0.0) {
        return Err(GridError::InvalidRange(format!(
            "reference price must be positive, got {}",
            reference_price
        )));
    }
    if !(price_range > 0.0 && price_range < 1.0) {
        return Err(GridError::InvalidRange(format!(
            "price_range must be in (0, 1), got {}",
            price_range
        )));
    }
    Ok((
        reference_price * (1.0 - price_range),
        reference_price * (1.0 + price_range),
    ))
}

/// Whether `price` lies inside the ladder
pub fn is_within(levels: &[GridLevel], price: f64) -> bool {
    match (levels.first(), levels.last()) {
        (Some(low), Some(high)) => price >= low.price && price <= high.price,
        _ => false,
    }
}

/// Whether `price` is within `threshold` (fraction of the ladder width) of either edge
pub fn near_boundary(levels: &[GridLevel], price: f64, threshold: f64) -> bool {
    match (levels.first(), levels.last()) {
        (Some(low), Some(high)) => {
            let margin = (high.price - low.price) * threshold;
            price <= low.price + margin || price >= high.price - margin
        }
        _ => false,
    }
}

/// Where a price sits relative to the ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryStatus {
    Inside,
    /// Inside, but within the warning margin of an edge
    NearEdge,
    Outside,
}

/// Classify `price` against the ladder, `threshold` being the edge margin as a fraction of its width
pub fn boundary_status(levels: &[GridLevel], price: f64, threshold: f64) -> BoundaryStatus {
    if !is_within(levels, price) {
        BoundaryStatus::Outside
    } else if near_boundary(levels, price, threshold) {
        BoundaryStatus::NearEdge
    } else {
        BoundaryStatus::Inside
    }
}

/// Index of the level above `index`, `None` at the top of the ladder
pub fn next_level_up(levels: &[GridLevel], index: usize) -> Option<usize> {
    index.checked_add(1).filter(|&i| i < levels.len())
}

/// Index of the level below `index`, `None` at the bottom of the ladder
pub fn next_level_down(levels: &[GridLevel], index: usize) -> Option<usize> {
    index.checked_sub(1).filter(|&i| i < levels.len())
}

/// Index of the level closest to `price`
pub fn nearest_level(levels: &[GridLevel], price: f64) -> Option<usize> {
    levels
        .iter()
        .min_by(|a, b| (a.price - price).abs().total_cmp(&(b.price - price).abs()))
        .map(|l| l.index)
}
