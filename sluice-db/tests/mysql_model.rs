// Run with: DATABASE_URL=mysql://... cargo test -p sluice-db --test mysql_model -- --ignored --test-threads=1

use serde_json::json;
use sluice_db::{ContextId, DatabaseConfig, Driver, Model, Order, PoolManager};

async fn pool() -> PoolManager {
    let config = DatabaseConfig {
        driver: Driver::Mysql,
        url: std::env::var("DATABASE_URL").expect("DATABASE_URL required"),
        max_connections: 8,
        ..DatabaseConfig::default()
    };
    let pool = PoolManager::connect(&config).await.expect("pool creation failed");
    let mut conn = pool.acquire_shared().await.expect("checkout");
    for sql in [
        "DROP TABLE IF EXISTS sluice_lines",
        "DROP TABLE IF EXISTS sluice_orders",
        "CREATE TABLE sluice_orders (id INT AUTO_INCREMENT PRIMARY KEY, \
         status VARCHAR(16) NOT NULL, total DECIMAL(10,2) NOT NULL DEFAULT 0)",
        "CREATE TABLE sluice_lines (id INT AUTO_INCREMENT PRIMARY KEY, \
         order_id INT NOT NULL, sku VARCHAR(16) NOT NULL)",
    ] {
        conn.execute(sql, &[]).await.expect("schema");
    }
    pool
}

#[tokio::test]
#[ignore = "requires database"]
async fn orders_round_trip_with_transactions() {
    let pool = pool().await;
    let ctx = ContextId::new(1);
    let mut orders = Model::new(&pool, ctx, "sluice_orders").await.unwrap();
    let mut observer = Model::new(&pool, ContextId::new(2), "sluice_orders").await.unwrap();

    orders.begin().await.unwrap();
    for (status, total) in [("paid", "10.00"), ("paid", "25.50"), ("open", "3.25")] {
        orders
            .insert_one([("status", json!(status)), ("total", json!(total))])
            .await
            .unwrap();
    }
    assert_eq!(observer.count("").await.unwrap().count(), 0);
    orders.commit().await.unwrap();

    let paid = orders
        .fields("id,total")
        .where_("status", "paid")
        .order_by("id", Order::Desc)
        .limit(5)
        .select()
        .await
        .unwrap();
    assert_eq!(paid.row_count(), 2);
    assert_eq!(paid.rows()[0]["total"], json!("25.50"));

    assert_eq!(observer.sum("total").await.unwrap().sum(), 38.75);

    pool.shutdown().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn joined_reads_bind_positionally() {
    let pool = pool().await;
    let ctx = ContextId::new(3);
    let mut orders = Model::new(&pool, ctx, "sluice_orders").await.unwrap();
    let mut lines = Model::new(&pool, ctx, "sluice_lines").await.unwrap();

    let order = orders.insert_one([("status", "paid")]).await.unwrap();
    lines
        .insert_multiple(
            "order_id,sku",
            vec![
                vec![json!(order.insert_id()), json!("A-1")],
                vec![json!(order.insert_id()), json!("B-2")],
            ],
        )
        .await
        .unwrap();

    let joined = orders
        .alias("o")
        .fields("o.id,l.sku")
        .inner_join("sluice_lines", "l", "l.order_id = o.id")
        .where_("o.status", "paid")
        .order_by("l.sku", Order::Asc)
        .select()
        .await
        .unwrap();
    assert_eq!(
        joined.to_array(),
        json!([
            {"id": order.insert_id(), "sku": "A-1"},
            {"id": order.insert_id(), "sku": "B-2"}
        ])
    );

    pool.retire(ctx).await;
    pool.shutdown().await;
}
