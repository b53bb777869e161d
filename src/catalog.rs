//! Static catalog of the supply-chain warehouse schema.
//!
//! The warehouse hosts a TPC-H-shaped supply-chain dataset. The catalog is
//! the single source of truth the assistant sees: table layouts, keys,
//! relationships, and the kinds of analysis users commonly run. It also owns
//! the canned query templates served by `GET /queries/templates`.

use serde::Serialize;

/// One warehouse table as described to the assistant.
pub struct TableInfo {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub primary_key: &'static str,
    pub foreign_keys: &'static [(&'static str, &'static str)],
    pub description: &'static str,
}

pub const TABLES: &[TableInfo] = &[
    TableInfo {
        name: "PART",
        columns: &[
            "PARTKEY", "NAME", "MFGR", "BRAND", "TYPE", "SIZE", "CONTAINER", "RETAILPRICE",
            "COMMENT",
        ],
        primary_key: "PARTKEY",
        foreign_keys: &[],
        description: "Parts catalog with specifications and pricing",
    },
    TableInfo {
        name: "SUPPLIER",
        columns: &[
            "SUPPKEY", "NAME", "ADDRESS", "NATIONKEY", "PHONE", "ACCTBAL", "COMMENT",
        ],
        primary_key: "SUPPKEY",
        foreign_keys: &[("NATIONKEY", "NATION.NATIONKEY")],
        description: "Supplier information and contact details",
    },
    TableInfo {
        name: "PARTSUPP",
        columns: &["PARTKEY", "SUPPKEY", "AVAILQTY", "SUPPLYCOST", "COMMENT"],
        primary_key: "PARTKEY, SUPPKEY",
        foreign_keys: &[
            ("PARTKEY", "PART.PARTKEY"),
            ("SUPPKEY", "SUPPLIER.SUPPKEY"),
        ],
        description: "Part-supplier relationships with availability and costs",
    },
    TableInfo {
        name: "CUSTOMER",
        columns: &[
            "CUSTKEY", "NAME", "ADDRESS", "NATIONKEY", "PHONE", "ACCTBAL", "MKTSEGMENT",
            "COMMENT",
        ],
        primary_key: "CUSTKEY",
        foreign_keys: &[("NATIONKEY", "NATION.NATIONKEY")],
        description: "Customer information and market segmentation",
    },
    TableInfo {
        name: "ORDERS",
        columns: &[
            "ORDERKEY", "CUSTKEY", "ORDERSTATUS", "TOTALPRICE", "ORDERDATE", "ORDERPRIORITY",
            "CLERK", "SHIPPRIORITY", "COMMENT",
        ],
        primary_key: "ORDERKEY",
        foreign_keys: &[("CUSTKEY", "CUSTOMER.CUSTKEY")],
        description: "Order header information",
    },
    TableInfo {
        name: "LINEITEM",
        columns: &[
            "ORDERKEY", "PARTKEY", "SUPPKEY", "LINENUMBER", "QUANTITY", "EXTENDEDPRICE",
            "DISCOUNT", "TAX", "RETURNFLAG", "LINESTATUS", "SHIPDATE", "COMMITDATE",
            "RECEIPTDATE", "SHIPINSTRUCT", "SHIPMODE", "COMMENT",
        ],
        primary_key: "ORDERKEY, LINENUMBER",
        foreign_keys: &[
            ("ORDERKEY", "ORDERS.ORDERKEY"),
            ("PARTKEY", "PART.PARTKEY"),
            ("SUPPKEY", "SUPPLIER.SUPPKEY"),
        ],
        description: "Detailed line items for each order (6M+ rows)",
    },
    TableInfo {
        name: "NATION",
        columns: &["NATIONKEY", "NAME", "REGIONKEY", "COMMENT"],
        primary_key: "NATIONKEY",
        foreign_keys: &[("REGIONKEY", "REGION.REGIONKEY")],
        description: "Nation/country reference data",
    },
    TableInfo {
        name: "REGION",
        columns: &["REGIONKEY", "NAME", "COMMENT"],
        primary_key: "REGIONKEY",
        foreign_keys: &[],
        description: "Geographic regions",
    },
];

pub const RELATIONSHIPS: &[&str] = &[
    "SUPPLIER -> NATION (via NATIONKEY)",
    "CUSTOMER -> NATION (via NATIONKEY)",
    "NATION -> REGION (via REGIONKEY)",
    "ORDERS -> CUSTOMER (via CUSTKEY)",
    "LINEITEM -> ORDERS (via ORDERKEY)",
    "LINEITEM -> PART (via PARTKEY)",
    "LINEITEM -> SUPPLIER (via SUPPKEY)",
    "PARTSUPP -> PART (via PARTKEY)",
    "PARTSUPP -> SUPPLIER (via SUPPKEY)",
];

pub const COMMON_ANALYSES: &[&str] = &[
    "Supplier performance analysis",
    "Sales forecasting by region",
    "Top customers by revenue",
    "Part demand analysis",
    "Order fulfillment metrics",
    "Geographic sales distribution",
    "Seasonal trends analysis",
    "Supply chain efficiency metrics",
];

/// Render the schema description block embedded in assistant prompts.
pub fn prompt_context() -> String {
    let mut context = String::from("Database Schema Information:\n\n");

    for table in TABLES {
        context.push_str(&format!("Table: {}\n", table.name));
        context.push_str(&format!("Description: {}\n", table.description));
        context.push_str(&format!("Columns: {}\n", table.columns.join(", ")));
        context.push_str(&format!("Primary Key: {}\n", table.primary_key));

        if !table.foreign_keys.is_empty() {
            let fks: Vec<String> = table
                .foreign_keys
                .iter()
                .map(|(col, target)| format!("{} -> {}", col, target))
                .collect();
            context.push_str(&format!("Foreign Keys: {}\n", fks.join(", ")));
        }

        context.push('\n');
    }

    context.push_str("Relationships:\n");
    for relationship in RELATIONSHIPS {
        context.push_str(&format!("- {}\n", relationship));
    }

    context.push_str("\nCommon Query Types:\n");
    for analysis in COMMON_ANALYSES {
        context.push_str(&format!("- {}\n", analysis));
    }

    context
}

/// A canned, ready-to-run query template.
#[derive(Debug, Clone, Serialize)]
pub struct QueryTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub sql_query: &'static str,
    pub tags: &'static [&'static str],
}

pub fn templates() -> Vec<QueryTemplate> {
    vec![
        QueryTemplate {
            name: "Top 10 Suppliers by Revenue",
            description: "Find the highest revenue generating suppliers",
            sql_query: "SELECT s.NAME as supplier_name, \
                SUM(l.EXTENDEDPRICE * (1 - l.DISCOUNT)) as total_revenue, \
                COUNT(DISTINCT l.ORDERKEY) as total_orders, n.NAME as nation \
                FROM SUPPLIER s \
                JOIN LINEITEM l ON s.SUPPKEY = l.SUPPKEY \
                JOIN NATION n ON s.NATIONKEY = n.NATIONKEY \
                WHERE l.SHIPDATE >= DATEADD(month, -3, CURRENT_DATE) \
                GROUP BY s.SUPPKEY, s.NAME, n.NAME \
                ORDER BY total_revenue DESC \
                LIMIT 10",
            tags: &["suppliers", "revenue", "performance"],
        },
        QueryTemplate {
            name: "Monthly Sales Trend",
            description: "Analyze monthly sales trends over time",
            sql_query: "SELECT DATE_TRUNC('month', l.SHIPDATE) as month, \
                SUM(l.EXTENDEDPRICE * (1 - l.DISCOUNT)) as revenue, \
                SUM(l.QUANTITY) as quantity_sold, \
                COUNT(DISTINCT l.ORDERKEY) as orders_count \
                FROM LINEITEM l \
                WHERE l.SHIPDATE >= DATEADD(year, -1, CURRENT_DATE) \
                GROUP BY DATE_TRUNC('month', l.SHIPDATE) \
                ORDER BY month",
            tags: &["sales", "trends", "monthly"],
        },
        QueryTemplate {
            name: "Customer Analysis by Region",
            description: "Analyze customer distribution and spending by region",
            sql_query: "SELECT r.NAME as region, \
                COUNT(DISTINCT c.CUSTKEY) as customer_count, \
                AVG(c.ACCTBAL) as avg_account_balance, \
                COUNT(DISTINCT o.ORDERKEY) as total_orders, \
                SUM(o.TOTALPRICE) as total_revenue \
                FROM REGION r \
                JOIN NATION n ON r.REGIONKEY = n.REGIONKEY \
                JOIN CUSTOMER c ON n.NATIONKEY = c.NATIONKEY \
                LEFT JOIN ORDERS o ON c.CUSTKEY = o.CUSTKEY \
                GROUP BY r.REGIONKEY, r.NAME \
                ORDER BY total_revenue DESC",
            tags: &["customers", "regions", "analysis"],
        },
        QueryTemplate {
            name: "Inventory Analysis",
            description: "Analyze part inventory levels and supplier availability",
            sql_query: "SELECT p.NAME as part_name, p.BRAND, p.TYPE, \
                COUNT(DISTINCT ps.SUPPKEY) as supplier_count, \
                AVG(ps.AVAILQTY) as avg_available_qty, \
                AVG(ps.SUPPLYCOST) as avg_supply_cost, p.RETAILPRICE \
                FROM PART p \
                JOIN PARTSUPP ps ON p.PARTKEY = ps.PARTKEY \
                GROUP BY p.PARTKEY, p.NAME, p.BRAND, p.TYPE, p.RETAILPRICE \
                HAVING supplier_count >= 2 \
                ORDER BY avg_available_qty DESC \
                LIMIT 20",
            tags: &["inventory", "parts", "suppliers"],
        },
    ]
}

/// CLI entry point — print the canned templates.
pub fn run_templates() {
    for template in templates() {
        println!("--- {} ---", template.name);
        println!("{}", template.description);
        println!("tags: {}", template.tags.join(", "));
        println!("{}", template.sql_query);
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_context_mentions_every_table() {
        let context = prompt_context();
        for table in TABLES {
            assert!(
                context.contains(&format!("Table: {}", table.name)),
                "missing table {}",
                table.name
            );
        }
        assert!(context.contains("Relationships:"));
        assert!(context.contains("Common Query Types:"));
    }

    #[test]
    fn test_prompt_context_includes_foreign_keys() {
        let context = prompt_context();
        assert!(context.contains("NATIONKEY -> NATION.NATIONKEY"));
    }

    #[test]
    fn test_templates_are_read_only() {
        for t in templates() {
            let upper = t.sql_query.to_uppercase();
            assert!(upper.trim_start().starts_with("SELECT"), "{}", t.name);
            assert!(!upper.contains("DROP"), "{}", t.name);
        }
    }
}
