//! The two long-running steps of a request: proving control of the domains and obtaining the
//! certificate.
//!
//! Both steps race a [`CancellationToken`]. Validation always removes its challenge records on
//! the way out, whether it succeeded, failed or was cancelled.

use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    acme::{IssuedCertificate, NewOrder},
    config::ControllerConfig,
    error::{Error, ErrorClass, Result},
    issuer::Issuer,
    request::DomainSet,
    solver::Challenge,
};

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;

        () = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Creates an order for `domains` and solves every authorization that still needs validation.
///
/// All or nothing: the returned order is ready to be finalized.
pub async fn validate(
    issuer: &Issuer,
    domains: &DomainSet,
    settings: &ControllerConfig,
    cancel: &CancellationToken,
) -> Result<NewOrder> {
    let order = cancellable(cancel, async {
        Ok::<_, Error>(issuer.acme().new_order(&domains.to_vec()).await?)
    })
    .await?;

    let solver = issuer.solver();
    let mut challenges = order
        .authorizations
        .iter()
        .filter(|auth| auth.needs_validation)
        .map(|auth| solver.challenge(&auth.domain, &auth.dns_proof))
        .collect::<Result<Vec<_>>>()?;

    log::info!(
        "order for {domains} needs {} of {} authorizations",
        challenges.len(),
        order.authorizations.len()
    );

    let res = cancellable(cancel, prove(issuer, &order, &mut challenges, settings)).await;

    if let Err(err) = solver.cleanup_all(&mut challenges).await {
        // the order itself is fine; a stale TXT record does not block issuance
        log::warn!("challenge cleanup for {domains} incomplete: {err}");
    }

    res.map(|()| order)
}

async fn prove(
    issuer: &Issuer,
    order: &NewOrder,
    challenges: &mut [Challenge],
    settings: &ControllerConfig,
) -> Result<()> {
    let solver = issuer.solver();

    // one at a time; providers limit writes per zone
    for challenge in challenges.iter_mut() {
        solver.publish(challenge).await?;
    }

    futures::future::try_join_all(
        challenges
            .iter_mut()
            .map(|challenge| solver.await_propagation(challenge)),
    )
    .await?;

    for auth in order.authorizations.iter().filter(|auth| auth.needs_validation) {
        let verdict = tokio::time::timeout(
            settings.validation_timeout,
            issuer.acme().validate(auth, settings.acme_poll_interval),
        )
        .await
        .map_err(|_| {
            Error::Transient(format!(
                "authorization of {} still pending after {:?}",
                auth.domain, settings.validation_timeout
            ))
        })?;

        verdict?;
        log::debug!("{} validated", auth.domain);
    }

    Ok(())
}

/// Finalizes `order` and downloads the certificate within `issuing_timeout`.
///
/// Rate limits and transient errors are waited out in place as long as the wait fits in the
/// window; the request stays in `Issuing` meanwhile.
pub async fn issue(
    issuer: &Issuer,
    order: &NewOrder,
    settings: &ControllerConfig,
    cancel: &CancellationToken,
) -> Result<IssuedCertificate> {
    let deadline = Instant::now() + settings.issuing_timeout;
    let mut attempt = 0;

    loop {
        let finalize = tokio::time::timeout_at(
            deadline,
            issuer.acme().finalize(order, settings.acme_poll_interval),
        );

        let err = match cancellable(cancel, async { Ok::<_, Error>(finalize.await) }).await? {
            Ok(Ok(cert)) => return Ok(cert),
            Ok(Err(err)) => Error::from(err),
            Err(_elapsed) => return Err(Error::IssuingTimeout(settings.issuing_timeout)),
        };

        let wait = match err.class() {
            // the order is invalid; only a new one can succeed
            _ if matches!(err, Error::AcmeValidationRejected { .. }) => return Err(err),

            ErrorClass::RateLimited(retry_after) => {
                retry_after.unwrap_or(settings.rate_limit_cooldown)
            }
            ErrorClass::Transient => settings.backoff.delay(attempt),
            ErrorClass::Permanent => return Err(err),
        };
        attempt += 1;

        if Instant::now() + wait >= deadline {
            log::warn!("finalizing {}: {err}; no time left to wait {wait:?}", order.url);
            return Err(err);
        }

        log::info!("finalizing {}: {err}; trying again in {wait:?}", order.url);

        cancellable(cancel, async {
            tokio::time::sleep(wait).await;
            Ok::<_, Error>(())
        })
        .await?;
    }
}
