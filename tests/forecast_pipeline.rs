use cltv::pipeline::{self, PipelineError};
use cltv::report::write_projections_csv;
use cltv::segment::SegmentationPolicy;
use cltv::{CustomerSummary, ForecastConfig, TimingModelParams, TimingObservation};
use std::io::Write;
use tempfile::NamedTempFile;

fn customer(id: &str, frequency: u32, recency: f64, t: f64, monetary: f64) -> CustomerSummary {
    CustomerSummary {
        customer_id: id.to_string(),
        recency,
        t,
        frequency,
        monetary,
    }
}

fn population() -> Vec<CustomerSummary> {
    let mut customers: Vec<CustomerSummary> = (0..120_u32)
        .map(|i| {
            let frequency = 1 + i % 8;
            let t = 25.0 + f64::from(i % 17) * 2.0;
            let recency = t * f64::from(1 + i % 5) / 6.0;
            let monetary = 35.0 + f64::from((i * 29) % 70);
            customer(&format!("c{i}"), frequency, recency, t, monetary)
        })
        .collect();
    for k in 0..3 {
        customers.push(customer(&format!("new{k}"), 0, 0.0, 30.0, 60.0));
    }
    customers
}

#[test]
fn identical_histories_get_identical_forecasts() {
    let forecast = pipeline::run(&population(), &ForecastConfig::default()).unwrap();
    let fresh: Vec<_> = forecast
        .projections
        .iter()
        .filter(|p| p.customer_id.starts_with("new"))
        .collect();
    assert_eq!(fresh.len(), 3);
    for other in &fresh[1..] {
        assert_eq!(other.expected_transactions_short, fresh[0].expected_transactions_short);
        assert_eq!(other.expected_transactions_long, fresh[0].expected_transactions_long);
        assert_eq!(other.expected_average_profit, fresh[0].expected_average_profit);
        assert_eq!(other.lifetime_value, fresh[0].lifetime_value);
        assert_eq!(other.probability_active, 1.0);
    }
    assert_eq!(
        fresh[0].expected_average_profit,
        forecast.monetary.params.population_mean().unwrap()
    );
}

#[test]
fn recent_buyers_are_more_likely_active() {
    let forecast = pipeline::run(&population(), &ForecastConfig::default()).unwrap();
    let params: TimingModelParams = forecast.timing.params;
    let just_bought = TimingObservation::new(5, 40.0, 40.0);
    let long_gone = TimingObservation::new(5, 4.0, 40.0);
    assert!(
        params.probability_active(&just_bought).unwrap()
            > params.probability_active(&long_gone).unwrap()
    );
}

#[test]
fn quantile_segments_split_customers_evenly() {
    let customers = population();
    let forecast = pipeline::run(&customers, &ForecastConfig::default()).unwrap();
    let labels: Vec<&str> = forecast.segments.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["D", "C", "B", "A"]);
    for tier in &forecast.segments {
        assert!(tier.count == 30 || tier.count == 31, "{tier:?}");
    }

    let best = forecast
        .projections
        .iter()
        .max_by(|a, b| a.lifetime_value.total_cmp(&b.lifetime_value))
        .unwrap();
    assert_eq!(best.segment, "A");
}

#[test]
fn threshold_segments_follow_breakpoints() {
    let mut config = ForecastConfig::default();
    config.segmentation = SegmentationPolicy::Thresholds {
        breakpoints: vec![50.0, 150.0],
        labels: vec!["low".into(), "mid".into(), "high".into()],
    };
    let forecast = pipeline::run(&population(), &config).unwrap();
    for p in &forecast.projections {
        let expected = if p.lifetime_value <= 50.0 {
            "low"
        } else if p.lifetime_value <= 150.0 {
            "mid"
        } else {
            "high"
        };
        assert_eq!(p.segment, expected);
    }
}

#[test]
fn invalid_history_is_reported_not_dropped() {
    let mut customers = population();
    customers.push(customer("broken", 2, 50.0, 40.0, 20.0));
    assert!(matches!(
        pipeline::run(&customers, &ForecastConfig::default()),
        Err(PipelineError::Timing(_))
    ));
}

#[test]
fn forecasts_a_customer_table_end_to_end() {
    let mut input = NamedTempFile::new().unwrap();
    writeln!(
        input,
        "master_id,order_channel,last_order_channel,first_order_date,last_order_date,last_order_date_online,last_order_date_offline,order_num_total_ever_online,order_num_total_ever_offline,customer_value_total_ever_offline,customer_value_total_ever_online,interested_in_categories_12"
    )
    .unwrap();
    for i in 0..80_u32 {
        let first_month = 1 + i % 9;
        let last_month = first_month + 1 + i % 3;
        writeln!(
            input,
            "id{i},Android App,Offline,2020-{first_month:02}-0{day},2021-{last_month:02}-1{day},2021-01-01,2021-01-01,{online}.0,{offline}.0,{spend_off}.5,{spend_on}.25,[KADIN]",
            day = 1 + i % 8,
            online = 1 + i % 6,
            offline = 1 + i % 3,
            spend_off = 40 + (i * 17) % 150,
            spend_on = 60 + (i * 31) % 400,
        )
        .unwrap();
    }
    input.flush().unwrap();

    let config = ForecastConfig::default();
    let customers = pipeline::load_customers(input.path(), &config).unwrap();
    assert_eq!(customers.len(), 80);
    assert!(customers.iter().all(|c| c.recency <= c.t && c.frequency >= 1));

    let forecast = pipeline::run(&customers, &config).unwrap();
    let output = NamedTempFile::new().unwrap();
    write_projections_csv(output.path(), &forecast.projections).unwrap();

    let mut reader = csv::Reader::from_path(output.path()).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(&headers[0], "customer_id");
    assert_eq!(&headers[headers.len() - 1], "segment");
    assert_eq!(reader.records().count(), 80);
}
