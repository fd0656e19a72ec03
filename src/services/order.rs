use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ORDER_SOURCE;
use crate::clock::Clock;
use crate::contracts::OrderCreated;
use crate::store::{Database, StoreError, Transaction};
use crate::writer::{DomainWriter, WriteError};

const ORDERS: &str = "orders";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub client_id: u64,
    pub items: Vec<NewOrderItem>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub client_id: u64,
    pub total_amount: Decimal,
    pub status: String,
    pub items: Vec<OrderItem>,
}

pub struct OrderService<D: Database> {
    writer: DomainWriter<D>,
}

impl<D: Database> OrderService<D> {
    pub fn new(db: D) -> Self {
        Self {
            writer: DomainWriter::new(db, ORDER_SOURCE),
        }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            writer: self.writer.with_clock(clock),
        }
    }

    pub fn database(&self) -> &D {
        self.writer.database()
    }

    /// Store a pending order with its line items and record `OrderCreated`.
    /// The total is the sum of quantity times unit price.
    pub fn create_order(&self, new: NewOrder) -> Result<Order, WriteError> {
        if new.items.is_empty() {
            return Err(WriteError::Invalid("an order needs at least one item".into()));
        }
        if let Some(item) = new
            .items
            .iter()
            .find(|item| item.quantity == 0 || item.unit_price < Decimal::ZERO)
        {
            return Err(WriteError::Invalid(format!(
                "invalid quantity or price for {}",
                item.product_name
            )));
        }

        let items: Vec<OrderItem> = new
            .items
            .into_iter()
            .map(|item| OrderItem {
                total_price: item.unit_price * Decimal::from(item.quantity),
                product_name: item.product_name,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect();
        let total_amount = items.iter().map(|item| item.total_price).sum();

        let (order, _) = self.writer.record_with(|tx| {
            let id = tx.next_id(ORDERS)?;
            let order = Order {
                id,
                client_id: new.client_id,
                total_amount,
                status: "pending".to_string(),
                items,
            };
            tx.put_as(ORDERS, &id.to_string(), &order)?;

            let event = OrderCreated {
                order_id: id,
                client_id: order.client_id,
                amount: order.total_amount,
            };
            Ok((order, event))
        })?;

        Ok(order)
    }

    pub fn get(&self, id: u64) -> Result<Option<Order>, StoreError> {
        let tx = self.database().begin()?;
        let order = tx.get_as(ORDERS, &id.to_string());
        tx.rollback();
        order
    }
}
