use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use chrono::{Duration, Utc};
use rust_decimal::Decimal;

use chalak_billing::{AddPayment, Invoice, IssueInvoice, NewInvoiceItem, PaymentMethod};
use chalak_core::{Entity, InstituteId, InvoiceId, Money, StudentId, UserId};
use chalak_infra::{BillingService, InMemoryBillingStore};

fn issue_cmd(total_cents: i64) -> IssueInvoice {
    let now = Utc::now();
    IssueInvoice {
        invoice_id: InvoiceId::new(),
        student_id: StudentId::new(),
        institute_id: InstituteId::new(),
        due_date: (now + Duration::days(30)).date_naive(),
        notes: None,
        items: vec![NewInvoiceItem {
            description: "Lesson block".to_string(),
            quantity: 10,
            unit_price: Money::from_cents(total_cents / 10),
        }],
        created_by: UserId::new(),
        occurred_at: now,
    }
}

fn payment(invoice_id: InvoiceId, cents: i64) -> AddPayment {
    AddPayment {
        invoice_id,
        amount: Money::from_cents(cents),
        method: PaymentMethod::Card,
        payment_date: None,
        notes: None,
        actor: UserId::new(),
        occurred_at: Utc::now(),
    }
}

/// Domain-only cost: balance check + reconciliation, no storage.
fn bench_accept_payment_domain(c: &mut Criterion) {
    let mut group = c.benchmark_group("accept_payment_domain");
    group.throughput(Throughput::Elements(1));

    group.bench_function("partial_payment", |b| {
        b.iter_batched(
            || {
                let invoice = Invoice::issue(&issue_cmd(100_000), Decimal::ZERO).unwrap();
                let cmd = payment(invoice.id(), 2_500);
                (invoice, cmd)
            },
            |(mut invoice, cmd)| black_box(invoice.accept_payment(&cmd).unwrap()),
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

/// Full service path on the in-memory store: begin, lock, decide, write, commit.
fn bench_add_payment_in_memory(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("add_payment_in_memory");
    group.throughput(Throughput::Elements(1));

    for existing in [10usize, 1_000] {
        let svc = BillingService::new(InMemoryBillingStore::new());
        let target = rt.block_on(async {
            for _ in 1..existing {
                svc.issue_invoice(issue_cmd(10_000)).await.unwrap();
            }
            // Large enough that a cent per iteration never settles it.
            svc.issue_invoice(issue_cmd(900_000_000_000)).await.unwrap()
        });

        group.bench_with_input(BenchmarkId::from_parameter(existing), &existing, |b, _| {
            b.to_async(&rt).iter(|| {
                let svc = &svc;
                let id = target.id();
                async move { black_box(svc.add_payment(payment(id, 1)).await.unwrap()) }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_accept_payment_domain, bench_add_payment_in_memory);
criterion_main!(benches);
