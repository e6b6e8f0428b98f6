//! Input validation utilities for the Farm Operations Platform

use rust_decimal::Decimal;

/// Longest natural-language prompt accepted by the AI query engine
pub const MAX_PROMPT_CHARS: usize = 2000;

// ============================================================================
// Block Validations
// ============================================================================

/// Validate block display name
pub fn validate_block_name(name: &str) -> Result<(), &'static str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Block name cannot be empty");
    }
    if trimmed.chars().count() > 100 {
        return Err("Block name must be at most 100 characters");
    }
    Ok(())
}

/// Validate block capacity. Zero means unlimited.
pub fn validate_max_plants(max_plants: i32) -> Result<(), &'static str> {
    if max_plants < 0 {
        return Err("Max plants cannot be negative");
    }
    Ok(())
}

/// Validate block area in square meters when given
pub fn validate_area(area: Option<Decimal>) -> Result<(), &'static str> {
    match area {
        Some(a) if a <= Decimal::ZERO => Err("Area must be greater than 0"),
        _ => Ok(()),
    }
}

// ============================================================================
// Harvest Validations
// ============================================================================

/// Validate a harvested quantity is positive
pub fn validate_harvest_quantity(quantity_kg: Decimal) -> Result<(), &'static str> {
    if quantity_kg <= Decimal::ZERO {
        return Err("Harvest quantity must be greater than 0");
    }
    Ok(())
}

// ============================================================================
// AI Query Validations
// ============================================================================

/// Validate a natural-language prompt before it is sent to the model
pub fn validate_prompt(prompt: &str) -> Result<(), &'static str> {
    if prompt.trim().is_empty() {
        return Err("Prompt cannot be empty");
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err("Prompt is too long");
    }
    Ok(())
}
